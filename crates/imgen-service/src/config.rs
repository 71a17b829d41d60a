//! Service configuration.

use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use imgen_core::PricingConfig;

/// Default provider endpoint.
pub const DEFAULT_PROVIDER_URL: &str = "https://api.kie.ai";

/// Default provider model.
pub const DEFAULT_PROVIDER_MODEL: &str = "nano-banana-pro";

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to `RocksDB` data directory (default: "/data/imgen").
    pub data_dir: String,

    /// HS256 secret for verifying caller JWTs.
    pub auth_jwt_secret: Option<String>,

    /// Admin API key for manual credit grants.
    pub admin_api_key: Option<String>,

    /// Provider gateway settings.
    pub provider: ProviderConfig,

    /// Job lifecycle settings.
    pub jobs: JobSettings,

    /// Worker tick in seconds.
    pub poll_interval_seconds: u64,

    /// How long a payment intent accepts transfers, in seconds.
    pub payment_intent_ttl_seconds: i64,

    /// Optional `Authorization: Apikey <key>` required on the payment webhook.
    pub payment_webhook_api_key: Option<String>,

    /// Optional HTTP sink for usage records.
    pub analytics_url: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    pub request_timeout_seconds: u64,

    /// Pricing configuration.
    pub pricing: PricingConfig,
}

/// Provider gateway settings.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider API.
    pub api_url: String,
    /// Bearer key. Jobs cannot be dispatched without it.
    pub api_key: Option<String>,
    /// URL the provider pushes task results to.
    pub callback_url: Option<String>,
    /// Model name sent with every task.
    pub model: String,
    /// Network timeout of every gateway call, in seconds.
    pub timeout_seconds: u64,
}

/// Knobs of the job reconciler.
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Age after which a non-terminal job is expired.
    pub timeout: Duration,
    /// Transient fetch failures tolerated before a job is expired.
    pub max_poll_errors: u32,
    /// Transient submit attempts before a job is expired.
    pub submit_max_attempts: u32,
    /// First backoff between submit attempts (doubles each time).
    pub submit_backoff: Duration,
    /// Concurrent status fetches per worker tick.
    pub poll_concurrency: usize,
    /// Age after which the worker dispatches a job still in `Created`.
    pub dispatch_grace: Duration,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30 * 60),
            max_poll_errors: 5,
            submit_max_attempts: 3,
            submit_backoff: Duration::from_millis(500),
            poll_concurrency: 8,
            dispatch_grace: Duration::from_secs(10),
        }
    }
}

/// Provider secrets file structure.
#[derive(Debug, Deserialize)]
struct ProviderSecrets {
    api_url: Option<String>,
    api_key: String,
    #[serde(default)]
    callback_url: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and secrets files.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            auth_jwt_secret: std::env::var("AUTH_JWT_SECRET").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            provider: load_provider_config(),
            jobs: JobSettings {
                timeout: Duration::from_secs(env_or("JOB_TIMEOUT_SECONDS", 1800)),
                max_poll_errors: env_or("MAX_POLL_ERRORS", defaults.jobs.max_poll_errors),
                submit_max_attempts: env_or(
                    "SUBMIT_MAX_ATTEMPTS",
                    defaults.jobs.submit_max_attempts,
                ),
                submit_backoff: defaults.jobs.submit_backoff,
                poll_concurrency: env_or("POLL_CONCURRENCY", defaults.jobs.poll_concurrency),
                dispatch_grace: Duration::from_secs(env_or("DISPATCH_GRACE_SECONDS", 10)),
            },
            poll_interval_seconds: env_or("POLL_INTERVAL_SECONDS", defaults.poll_interval_seconds),
            payment_intent_ttl_seconds: env_or(
                "PAYMENT_INTENT_TTL_SECONDS",
                defaults.payment_intent_ttl_seconds,
            ),
            payment_webhook_api_key: std::env::var("PAYMENT_WEBHOOK_API_KEY").ok(),
            analytics_url: std::env::var("ANALYTICS_URL").ok(),
            cors_origins: std::env::var("CORS_ORIGINS")
                .unwrap_or_else(|_| "*".into())
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
            max_body_bytes: env_or("MAX_BODY_BYTES", defaults.max_body_bytes),
            request_timeout_seconds: env_or(
                "REQUEST_TIMEOUT_SECONDS",
                defaults.request_timeout_seconds,
            ),
            pricing: PricingConfig::default(),
        }
    }

    /// Payment intent lifetime.
    #[must_use]
    pub fn payment_intent_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.payment_intent_ttl_seconds)
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// missing or malformed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = %name, value = %raw, "Ignoring malformed environment variable");
            default
        }),
        Err(_) => default,
    }
}

/// Load provider settings from the secrets file or environment.
fn load_provider_config() -> ProviderConfig {
    let model = std::env::var("PROVIDER_MODEL").unwrap_or_else(|_| DEFAULT_PROVIDER_MODEL.into());
    let timeout_seconds = env_or("PROVIDER_TIMEOUT_SECONDS", 30);

    let secret_paths = [
        ".secrets/provider.json",
        "imgen/.secrets/provider.json",
        "../.secrets/provider.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<ProviderSecrets>(path) {
            tracing::info!(path = %path, "Loaded provider secrets from file");
            return ProviderConfig {
                api_url: secrets
                    .api_url
                    .unwrap_or_else(|| DEFAULT_PROVIDER_URL.into()),
                api_key: Some(secrets.api_key),
                callback_url: secrets.callback_url,
                model,
                timeout_seconds,
            };
        }
    }

    // Fall back to environment variables
    tracing::debug!("Provider secrets file not found, using environment variables");
    ProviderConfig {
        api_url: std::env::var("PROVIDER_API_URL").unwrap_or_else(|_| DEFAULT_PROVIDER_URL.into()),
        api_key: std::env::var("PROVIDER_API_KEY").ok(),
        callback_url: std::env::var("PROVIDER_CALLBACK_URL").ok(),
        model,
        timeout_seconds,
    }
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_PROVIDER_URL.into(),
            api_key: None,
            callback_url: None,
            model: DEFAULT_PROVIDER_MODEL.into(),
            timeout_seconds: 30,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/imgen".into(),
            auth_jwt_secret: None,
            admin_api_key: None,
            provider: ProviderConfig::default(),
            jobs: JobSettings::default(),
            poll_interval_seconds: 5,
            payment_intent_ttl_seconds: 900,
            payment_webhook_api_key: None,
            analytics_url: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024,
            request_timeout_seconds: 30,
            pricing: PricingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServiceConfig::default();
        assert_eq!(config.jobs.timeout, Duration::from_secs(1800));
        assert_eq!(config.jobs.max_poll_errors, 5);
        assert_eq!(config.jobs.submit_max_attempts, 3);
        assert_eq!(config.jobs.poll_concurrency, 8);
        assert_eq!(config.jobs.dispatch_grace, Duration::from_secs(10));
        assert_eq!(config.payment_intent_ttl(), chrono::Duration::minutes(15));
        assert_eq!(config.provider.model, "nano-banana-pro");
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        assert_eq!(env_or::<u32>("IMGEN_TEST_SURELY_UNSET_VAR", 7), 7);
    }
}

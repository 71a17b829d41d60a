//! Application state.

use std::sync::Arc;

use imgen_store::RocksStore;

use crate::analytics::UsageReporter;
use crate::config::ServiceConfig;
use crate::provider::{KieClient, ProviderError, ProviderGateway};
use crate::reconciler::{JobReconciler, PaymentReconciler};

/// Application state shared across handlers and the background worker.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<RocksStore>,

    /// Service configuration.
    pub config: ServiceConfig,

    /// Generation job reconciler.
    pub jobs: Arc<JobReconciler>,

    /// Payment webhook reconciler.
    pub payments: Arc<PaymentReconciler>,
}

impl AppState {
    /// Create the state with the configured Kie gateway.
    ///
    /// # Errors
    ///
    /// Fails if the provider HTTP client cannot be built.
    pub fn new(store: Arc<RocksStore>, config: ServiceConfig) -> Result<Self, ProviderError> {
        let gateway = KieClient::from_config(&config.provider)?;
        tracing::info!(
            provider_url = %config.provider.api_url,
            model = %config.provider.model,
            callbacks = config.provider.callback_url.is_some(),
            "Provider gateway configured"
        );
        Ok(Self::with_gateway(store, config, Arc::new(gateway)))
    }

    /// Create the state around an explicit gateway.
    #[must_use]
    pub fn with_gateway(
        store: Arc<RocksStore>,
        config: ServiceConfig,
        gateway: Arc<dyn ProviderGateway>,
    ) -> Self {
        let usage = UsageReporter::new(config.analytics_url.as_deref());
        if !usage.is_forwarding() {
            tracing::warn!("Analytics not configured - usage records will only be logged");
        }

        let jobs = JobReconciler::new(
            store.clone(),
            gateway,
            config.jobs.clone(),
            config.pricing.clone(),
            usage.clone(),
        );
        let payments = PaymentReconciler::new(store.clone(), config.payment_intent_ttl(), usage);

        Self {
            store,
            config,
            jobs: Arc::new(jobs),
            payments: Arc::new(payments),
        }
    }
}

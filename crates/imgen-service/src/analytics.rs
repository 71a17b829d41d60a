//! Usage side channel.
//!
//! Every terminal job and every completed payment produces one
//! [`UsageRecord`]. Records are always logged under the `usage` target and,
//! when an analytics endpoint is configured, forwarded to it in the
//! background. Forwarding is best-effort: failures are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use imgen_core::UsageRecord;

/// Maximum number of delivery attempts per record.
const ANALYTICS_MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
const ANALYTICS_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff delay in milliseconds.
const ANALYTICS_MAX_BACKOFF_MS: u64 = 5000;

#[derive(Debug)]
struct Sink {
    client: reqwest::Client,
    url: String,
}

/// Emits usage records.
#[derive(Debug, Clone, Default)]
pub struct UsageReporter {
    sink: Option<Arc<Sink>>,
}

impl UsageReporter {
    /// Create a reporter forwarding to `url`, or log-only when `None`.
    #[must_use]
    pub fn new(url: Option<&str>) -> Self {
        let Some(url) = url else {
            return Self::default();
        };

        match reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
        {
            Ok(client) => {
                tracing::info!(analytics_url = %url, "Usage forwarding enabled");
                Self {
                    sink: Some(Arc::new(Sink {
                        client,
                        url: url.to_string(),
                    })),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to create analytics client");
                Self::default()
            }
        }
    }

    /// Whether records are forwarded over HTTP.
    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.sink.is_some()
    }

    /// Log `record` and forward it in the background.
    pub fn report(&self, record: UsageRecord) {
        tracing::info!(
            target: "usage",
            subject_id = %record.subject_id,
            user_id = %record.user_id,
            kind = record.kind.as_str(),
            credits = record.credits,
            "Usage recorded"
        );

        if let Some(sink) = &self.sink {
            let sink = Arc::clone(sink);
            tokio::spawn(async move {
                if let Err(e) = forward_with_retry(&sink, &record).await {
                    tracing::warn!(
                        subject_id = %record.subject_id,
                        error = %e,
                        "Dropping usage record"
                    );
                }
            });
        }
    }
}

/// Forward a record with exponential backoff retry.
async fn forward_with_retry(sink: &Sink, record: &UsageRecord) -> Result<(), reqwest::Error> {
    let mut attempt = 0;
    let mut backoff_ms = ANALYTICS_INITIAL_BACKOFF_MS;

    loop {
        match forward(sink, record).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;

                if attempt >= ANALYTICS_MAX_RETRIES {
                    tracing::warn!(
                        subject_id = %record.subject_id,
                        attempt = %attempt,
                        error = %e,
                        "Usage forwarding failed after max retries"
                    );
                    return Err(e);
                }

                tracing::debug!(
                    subject_id = %record.subject_id,
                    attempt = %attempt,
                    backoff_ms = %backoff_ms,
                    error = %e,
                    "Usage forwarding failed, retrying"
                );

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * 2).min(ANALYTICS_MAX_BACKOFF_MS);
            }
        }
    }
}

async fn forward(sink: &Sink, record: &UsageRecord) -> Result<(), reqwest::Error> {
    sink.client
        .post(&sink.url)
        .json(record)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

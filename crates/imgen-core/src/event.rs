//! Processed-event records for deduplicating at-least-once deliveries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which external system delivered an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    /// The image-generation provider (terminal task outcomes).
    Provider,
    /// The bank-transfer payment gateway (webhooks).
    PaymentGateway,
}

impl SourceSystem {
    /// Stable name, also used as the storage key prefix.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provider => "provider",
            Self::PaymentGateway => "payment_gateway",
        }
    }
}

/// Key identifying one external event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventKey {
    /// Delivering system.
    pub source: SourceSystem,
    /// The system's own identifier for the event.
    pub external_id: String,
}

impl EventKey {
    /// Key for an arbitrary event.
    #[must_use]
    pub fn new(source: SourceSystem, external_id: impl Into<String>) -> Self {
        Self {
            source,
            external_id: external_id.into(),
        }
    }

    /// Key for the terminal outcome of a provider task. Success and failure
    /// share the key so a task can only ever finalize once.
    #[must_use]
    pub fn provider_task(provider: &str, task_id: &str) -> Self {
        Self::new(SourceSystem::Provider, format!("{provider}:{task_id}"))
    }

    /// Key for a payment gateway webhook delivery.
    #[must_use]
    pub fn payment(event_id: impl Into<String>) -> Self {
        Self::new(SourceSystem::PaymentGateway, event_id)
    }

    /// Storage form: `source/external_id`.
    #[must_use]
    pub fn to_storage_key(&self) -> Vec<u8> {
        format!("{}/{}", self.source.as_str(), self.external_id).into_bytes()
    }
}

/// A persisted record that an event has been handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    /// The event.
    pub key: EventKey,
    /// When the event was first accepted.
    pub first_seen_at: DateTime<Utc>,
}

impl ProcessedEventRecord {
    /// Record `key` as seen now.
    #[must_use]
    pub fn new(key: EventKey) -> Self {
        Self {
            key,
            first_seen_at: Utc::now(),
        }
    }
}

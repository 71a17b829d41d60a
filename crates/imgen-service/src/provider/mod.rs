//! Provider gateway.
//!
//! A gateway translates a [`GenerationRequest`] into one provider's wire
//! protocol and normalizes that provider's asynchronous status vocabulary into
//! [`NormalizedStatus`]. Gateways are stateless: they never touch the store or
//! the ledger, which keeps them testable against a mock server.

pub mod kie;
pub mod types;

pub use kie::KieClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use imgen_core::GenerationRequest;

/// Errors returned by a provider gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The provider throttled us. Transient.
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    /// The provider rejected the request itself. Terminal.
    #[error("provider rejected request: {0}")]
    InvalidRequest(String),

    /// Network failure, timeout, 5xx or an undecodable response. Transient.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unavailable(_))
    }
}

/// Internal status vocabulary shared by every provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizedState {
    /// Accepted, not started.
    Waiting,
    /// Work in progress, or any status we do not recognise.
    Processing,
    /// Finished with a result.
    Success,
    /// Finished without a result.
    Failed,
}

/// One status observation of a provider task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedStatus {
    /// Normalized state.
    pub state: NormalizedState,
    /// Result URL. Always present when `state` is `Success`.
    pub result_ref: Option<String>,
    /// Provider-supplied failure detail. Logged, never shown to users.
    pub error_detail: Option<String>,
}

impl NormalizedStatus {
    /// Waiting, no result.
    #[must_use]
    pub const fn waiting() -> Self {
        Self {
            state: NormalizedState::Waiting,
            result_ref: None,
            error_detail: None,
        }
    }

    /// Processing, no result.
    #[must_use]
    pub const fn processing() -> Self {
        Self {
            state: NormalizedState::Processing,
            result_ref: None,
            error_detail: None,
        }
    }

    /// Succeeded with `result_ref`.
    #[must_use]
    pub fn success(result_ref: impl Into<String>) -> Self {
        Self {
            state: NormalizedState::Success,
            result_ref: Some(result_ref.into()),
            error_detail: None,
        }
    }

    /// Failed with `detail`.
    #[must_use]
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            state: NormalizedState::Failed,
            result_ref: None,
            error_detail: Some(detail.into()),
        }
    }
}

/// A task status pushed by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackStatus {
    /// Provider task the status belongs to.
    pub task_id: String,
    /// The observation.
    pub status: NormalizedStatus,
}

/// Contract every image-generation provider integration implements.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Stable provider name, used in task indexes and idempotency keys.
    fn name(&self) -> &str;

    /// Submit a generation request and return the provider's task id.
    ///
    /// # Errors
    ///
    /// [`ProviderError::is_transient`] tells whether a retry may succeed.
    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError>;

    /// Fetch and normalize the current status of a task.
    ///
    /// # Errors
    ///
    /// As [`Self::submit`]; an unknown task is `InvalidRequest`.
    async fn fetch_status(&self, task_id: &str) -> Result<NormalizedStatus, ProviderError>;

    /// Decode a status pushed to the callback endpoint.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` for a body that does not parse.
    fn parse_callback(&self, body: &[u8]) -> Result<CallbackStatus, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::RateLimited("slow down".into()).is_transient());
        assert!(ProviderError::Unavailable("502".into()).is_transient());
        assert!(!ProviderError::InvalidRequest("bad prompt".into()).is_transient());
    }
}

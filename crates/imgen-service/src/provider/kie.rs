//! Kie-style jobs API client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use imgen_core::GenerationRequest;

use super::types::{classify_code, CreateTaskData, CreateTaskRequest, Envelope, RecordInfo, TaskInput};
use super::{CallbackStatus, NormalizedStatus, ProviderError, ProviderGateway};
use crate::config::ProviderConfig;

/// Name under which tasks of this gateway are indexed.
pub const PROVIDER_NAME: &str = "kie";

/// Kie jobs API client.
#[derive(Debug, Clone)]
pub struct KieClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    callback_url: Option<String>,
}

impl KieClient {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - API root (e.g., `"https://api.kie.ai"`)
    /// * `api_key` - Bearer key
    /// * `model` - Model sent with every task
    /// * `timeout` - Network timeout of every call
    ///
    /// # Errors
    ///
    /// `Unavailable` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            callback_url: None,
        })
    }

    /// Build a client from service configuration.
    ///
    /// # Errors
    ///
    /// As [`Self::new`].
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config.api_key.clone().unwrap_or_else(|| {
            tracing::warn!("Provider API key not configured - job submissions will be rejected");
            String::new()
        });

        let client = Self::new(
            &config.api_url,
            api_key,
            &config.model,
            Duration::from_secs(config.timeout_seconds),
        )?;
        Ok(match &config.callback_url {
            Some(url) => client.with_callback_url(url),
            None => client,
        })
    }

    /// Set the URL the provider pushes final statuses to.
    #[must_use]
    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    /// Fetch the raw record of a task.
    ///
    /// # Errors
    ///
    /// Transport failures and non-success codes, classified like HTTP statuses.
    pub async fn record_info(&self, task_id: &str) -> Result<RecordInfo, ProviderError> {
        let url = format!("{}/api/v1/jobs/recordInfo", self.base_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("taskId", task_id)])
            .send()
            .await
            .map_err(transport_error)?;

        self.handle_response::<RecordInfo>(response).await
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(status = %status, body = %body, "Provider returned an error status");
            let message = if status == StatusCode::TOO_MANY_REQUESTS {
                "rate limited".to_string()
            } else {
                format!("HTTP {status}")
            };
            return Err(classify_code(i64::from(status.as_u16()), message));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("undecodable response: {e}")))?;

        envelope.into_data()
    }
}

fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Unavailable("request timed out".into())
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl ProviderGateway for KieClient {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    async fn submit(&self, request: &GenerationRequest) -> Result<String, ProviderError> {
        let url = format!("{}/api/v1/jobs/createTask", self.base_url);
        let body = CreateTaskRequest {
            model: &self.model,
            call_back_url: self.callback_url.as_deref(),
            input: TaskInput {
                prompt: &request.prompt,
                image_input: &request.image_inputs,
                aspect_ratio: request.aspect_ratio.as_str(),
                resolution: request.resolution.as_str(),
                output_format: request.output_format.as_str(),
            },
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let data = self.handle_response::<CreateTaskData>(response).await?;
        if data.task_id.is_empty() {
            return Err(ProviderError::Unavailable("empty task id".into()));
        }

        tracing::debug!(task_id = %data.task_id, model = %self.model, "Provider task created");
        Ok(data.task_id)
    }

    async fn fetch_status(&self, task_id: &str) -> Result<NormalizedStatus, ProviderError> {
        Ok(self.record_info(task_id).await?.normalize())
    }

    fn parse_callback(&self, body: &[u8]) -> Result<CallbackStatus, ProviderError> {
        // Failure callbacks carry a non-200 code alongside a full record, so
        // only the record is inspected.
        let envelope: Envelope<RecordInfo> = serde_json::from_slice(body)
            .map_err(|e| ProviderError::InvalidRequest(format!("malformed callback: {e}")))?;
        let record = envelope
            .data
            .ok_or_else(|| ProviderError::InvalidRequest("callback has no data".into()))?;

        Ok(CallbackStatus {
            status: record.normalize(),
            task_id: record.task_id,
        })
    }
}

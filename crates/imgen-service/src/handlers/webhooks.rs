//! Webhook handlers for the payment gateway and the generation provider.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::reconciler::{Observation, ReconcileError, WebhookOutcome, PAYMENT_NOT_RECOGNIZED_MESSAGE};
use crate::state::AppState;

/// Bank-transfer notification (`SePay` style).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentWebhook {
    /// Gateway transaction id, numeric or string.
    pub id: EventId,
    /// Transfer memo.
    #[serde(default)]
    pub content: String,
    /// Transferred amount.
    pub transfer_amount: i64,
    /// `"in"` for incoming transfers.
    #[serde(default)]
    pub transfer_type: Option<String>,
    /// Bank reference code.
    #[serde(default)]
    pub reference_code: Option<String>,
}

/// An event id that may arrive as a number or a string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    /// Numeric id.
    Number(u64),
    /// String id.
    Text(String),
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Always `true`: the delivery was accepted and must not be retried.
    pub success: bool,
    /// What the delivery did.
    pub outcome: String,
    /// User-facing message for deliveries that credited nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    fn new(outcome: &str, message: Option<&str>) -> Self {
        Self {
            success: true,
            outcome: outcome.to_string(),
            message: message.map(str::to_string),
        }
    }
}

/// Handle a payment gateway notification.
///
/// Every outcome that changed nothing answers 200 so the gateway stops
/// redelivering. Only storage failures answer with an error.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    if let Some(expected) = &state.config.payment_webhook_api_key {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Apikey "))
            .ok_or(ApiError::Unauthorized)?;
        if !constant_time_eq(provided.trim(), expected) {
            tracing::warn!("Payment webhook with invalid API key");
            return Err(ApiError::Unauthorized);
        }
    }

    let webhook: PaymentWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let event_id = webhook.id.to_string();

    if webhook
        .transfer_type
        .as_deref()
        .is_some_and(|t| !t.eq_ignore_ascii_case("in"))
    {
        tracing::debug!(event_id = %event_id, "Ignoring outgoing transfer");
        return Ok(Json(WebhookResponse::new("ignored", None)));
    }

    tracing::info!(
        event_id = %event_id,
        amount = webhook.transfer_amount,
        reference = ?webhook.reference_code,
        "Payment webhook received"
    );

    let outcome = state
        .payments
        .handle_webhook(&event_id, &webhook.content, webhook.transfer_amount)?;

    let message = match &outcome {
        WebhookOutcome::Completed(_) | WebhookOutcome::AlreadyProcessed => None,
        WebhookOutcome::Mismatched(_) | WebhookOutcome::Expired => {
            Some(PAYMENT_NOT_RECOGNIZED_MESSAGE)
        }
    };

    Ok(Json(WebhookResponse::new(outcome.as_str(), message)))
}

/// Handle a task status pushed by the generation provider.
pub async fn provider_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let callback = state.jobs.gateway().parse_callback(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected provider callback");
        ApiError::BadRequest("Malformed callback".into())
    })?;

    tracing::debug!(
        task_id = %callback.task_id,
        state = ?callback.status.state,
        "Provider callback received"
    );

    let outcome = match state.jobs.handle_callback(&callback).await {
        Ok(Observation::Finalized(_)) => "finalized",
        Ok(Observation::Progressed(_)) => "progressed",
        Ok(Observation::Unchanged) => "unchanged",
        Ok(Observation::AlreadyFinal) => "already_processed",
        Err(ReconcileError::NotFound(_)) => {
            tracing::warn!(task_id = %callback.task_id, "Callback for unknown task");
            "ignored"
        }
        Err(e) => return Err(e.into()),
    };

    Ok(Json(WebhookResponse::new(outcome, None)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_accepts_numbers_and_strings() {
        let numeric: PaymentWebhook = serde_json::from_str(
            r#"{"id": 92704, "content": "PAY-ABC123", "transferAmount": 50000, "transferType": "in"}"#,
        )
        .unwrap();
        assert_eq!(numeric.id.to_string(), "92704");

        let text: PaymentWebhook =
            serde_json::from_str(r#"{"id": "tx-9", "transferAmount": 1}"#).unwrap();
        assert_eq!(text.id.to_string(), "tx-9");
        assert!(text.content.is_empty());
    }
}

//! Payment intent handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use imgen_core::{PaymentIntent, PaymentIntentId, PaymentState};

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Smallest top-up accepted.
const MIN_TOP_UP: i64 = 1_000;

/// Largest top-up accepted.
const MAX_TOP_UP: i64 = 100_000_000;

/// Create intent request.
#[derive(Debug, Deserialize)]
pub struct CreateIntentRequest {
    /// Credits to buy. The transfer must be at least this much.
    pub amount: i64,
}

/// Payment intent response.
#[derive(Debug, Serialize)]
pub struct IntentResponse {
    /// Intent ID.
    pub intent_id: String,
    /// Token to put in the transfer memo.
    pub match_token: String,
    /// Credits granted on completion.
    pub amount: i64,
    /// Lifecycle state.
    pub state: PaymentState,
    /// Transfers after this instant are not credited.
    pub expires_at: String,
    /// When the ledger was credited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<PaymentIntent> for IntentResponse {
    fn from(intent: PaymentIntent) -> Self {
        Self {
            intent_id: intent.id.to_string(),
            match_token: intent.match_token,
            amount: intent.expected_amount,
            state: intent.state,
            expires_at: intent.expires_at.to_rfc3339(),
            completed_at: intent.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Announce a bank-transfer top-up.
pub async fn create_intent(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Json(body): Json<CreateIntentRequest>,
) -> Result<(StatusCode, Json<IntentResponse>), ApiError> {
    if body.amount < MIN_TOP_UP {
        return Err(ApiError::BadRequest(format!(
            "Minimum top-up is {MIN_TOP_UP} credits"
        )));
    }
    if body.amount > MAX_TOP_UP {
        return Err(ApiError::BadRequest(format!(
            "Maximum top-up is {MAX_TOP_UP} credits"
        )));
    }

    let intent = state.payments.create_intent(auth.user_id, body.amount)?;

    Ok((StatusCode::CREATED, Json(IntentResponse::from(intent))))
}

/// Get one of the caller's intents.
pub async fn get_intent(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Path(intent_id): Path<String>,
) -> Result<Json<IntentResponse>, ApiError> {
    let intent_id: PaymentIntentId = intent_id
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid intent ID".into()))?;

    let intent = state.payments.get_intent(&intent_id)?;
    if intent.owner_id != auth.user_id {
        return Err(ApiError::NotFound("Payment intent not found".into()));
    }

    Ok(Json(IntentResponse::from(intent)))
}

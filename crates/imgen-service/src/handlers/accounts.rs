//! Account management handlers.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use imgen_core::LedgerAccount;
use imgen_store::Store;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

/// Account response.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    /// User ID.
    pub user_id: String,
    /// Spendable credits.
    pub balance: i64,
    /// Credits reserved by in-flight jobs.
    pub held: i64,
    /// Lifetime credits bought.
    pub lifetime_purchased: i64,
    /// Lifetime credits granted.
    pub lifetime_granted: i64,
    /// Lifetime credits spent.
    pub lifetime_used: i64,
    /// Created timestamp.
    pub created_at: String,
}

impl From<&LedgerAccount> for AccountResponse {
    fn from(account: &LedgerAccount) -> Self {
        Self {
            user_id: account.user_id.to_string(),
            balance: account.balance,
            held: account.held,
            lifetime_purchased: account.lifetime_purchased,
            lifetime_granted: account.lifetime_granted,
            lifetime_used: account.lifetime_used,
            created_at: account.created_at.to_rfc3339(),
        }
    }
}

/// Open a ledger account for the caller.
pub async fn create_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<(StatusCode, Json<AccountResponse>), ApiError> {
    if state.store.get_account(&auth.user_id)?.is_some() {
        return Err(ApiError::Conflict("Account already exists".into()));
    }

    let account = state.store.open_account(&auth.user_id)?;

    tracing::info!(user_id = %auth.user_id, "Account created");

    Ok((StatusCode::CREATED, Json(AccountResponse::from(&account))))
}

/// Get the caller's account.
pub async fn get_account(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<AccountResponse>, ApiError> {
    let account = state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(AccountResponse::from(&account)))
}

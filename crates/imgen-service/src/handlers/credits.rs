//! Credit balance and transaction handlers.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use imgen_core::{CreditSource, CreditTransaction, UserId};
use imgen_store::Store;

use crate::auth::{AdminAuth, AuthUser};
use crate::error::ApiError;
use crate::state::AppState;

/// Balance response.
#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    /// Spendable credits.
    pub available: i64,
    /// Credits reserved by in-flight jobs.
    pub held: i64,
}

/// Get current credit balance.
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
) -> Result<Json<BalanceResponse>, ApiError> {
    let account = state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    Ok(Json(BalanceResponse {
        available: account.balance,
        held: account.held,
    }))
}

/// Transaction list query parameters.
#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    /// Maximum number of transactions to return (default: 50).
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Offset for pagination (default: 0).
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    50
}

/// Transaction response.
#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    /// Transaction ID.
    pub id: String,
    /// Transaction type.
    pub transaction_type: String,
    /// Credits moved.
    pub amount: i64,
    /// Change of the spendable balance (negative for holds).
    pub available_delta: i64,
    /// Balance after this transaction.
    pub balance_after: i64,
    /// Held amount after this transaction.
    pub held_after: i64,
    /// Job or payment intent behind the movement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Description.
    pub description: String,
    /// Timestamp.
    pub created_at: String,
}

impl From<&CreditTransaction> for TransactionResponse {
    fn from(tx: &CreditTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            transaction_type: tx.transaction_type.as_str().to_string(),
            amount: tx.amount,
            available_delta: tx.available_delta(),
            balance_after: tx.balance_after,
            held_after: tx.held_after,
            reference: tx.reference.clone(),
            description: tx.description.clone(),
            created_at: tx.created_at.to_rfc3339(),
        }
    }
}

/// List transactions response.
#[derive(Debug, Serialize)]
pub struct ListTransactionsResponse {
    /// Transactions (newest first).
    pub transactions: Vec<TransactionResponse>,
    /// Whether there are more transactions.
    pub has_more: bool,
}

/// List transaction history.
pub async fn list_transactions(
    State(state): State<Arc<AppState>>,
    auth: AuthUser,
    Query(query): Query<ListTransactionsQuery>,
) -> Result<Json<ListTransactionsResponse>, ApiError> {
    state
        .store
        .get_account(&auth.user_id)?
        .ok_or_else(|| ApiError::NotFound("Account not found".into()))?;

    // Fetch one more than requested to determine has_more
    let limit = query.limit.min(100);
    let transactions =
        state
            .store
            .list_transactions_by_user(&auth.user_id, limit + 1, query.offset)?;

    let has_more = transactions.len() > limit;
    let transactions: Vec<_> = transactions
        .iter()
        .take(limit)
        .map(TransactionResponse::from)
        .collect();

    Ok(Json(ListTransactionsResponse {
        transactions,
        has_more,
    }))
}

/// Admin grant request.
#[derive(Debug, Deserialize)]
pub struct AdminAddCreditsRequest {
    /// Receiving user.
    pub user_id: String,
    /// Credits to add.
    pub amount: i64,
    /// Why the grant was made (audit log only).
    pub reason: String,
}

/// Grant credits to a user (admin only).
pub async fn admin_add_credits(
    State(state): State<Arc<AppState>>,
    admin: AdminAuth,
    Json(body): Json<AdminAddCreditsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id: UserId = body
        .user_id
        .parse()
        .map_err(|_| ApiError::BadRequest("Invalid user ID".into()))?;
    if body.amount <= 0 {
        return Err(ApiError::BadRequest("Amount must be positive".into()));
    }

    let reference = format!("admin:{}", admin.admin_id);
    let account = state
        .store
        .credit(&user_id, body.amount, CreditSource::Grant, Some(&reference))?;

    tracing::info!(
        user_id = %user_id,
        admin_id = %admin.admin_id,
        amount = body.amount,
        reason = %body.reason,
        new_balance = account.balance,
        "Credits granted"
    );

    Ok(Json(serde_json::json!({
        "user_id": user_id.to_string(),
        "balance": account.balance,
        "held": account.held
    })))
}

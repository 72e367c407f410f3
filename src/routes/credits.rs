use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use time::OffsetDateTime;
use tracing::error;

use crate::models::credit::CreditAccount;
use crate::responses::JsonResponse;
use crate::routes::auth::UnifiedAuth;
use crate::services::credit_gate::OperationType;
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: i64 = 20;
const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CheckCreditsRequest {
    pub operation: OperationType,
}

/// Balance snapshot. Users who were never granted credits read as zeros.
pub async fn get_credits(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
) -> Response {
    match state.ledger.get_balance(session.user_id).await {
        Ok(account) => {
            let account = account
                .unwrap_or_else(|| CreditAccount::empty(session.user_id, OffsetDateTime::now_utc()));
            Json(json!({ "success": true, "account": account })).into_response()
        }
        Err(err) => {
            error!(user_id = %session.user_id, ?err, "failed to load credit balance");
            JsonResponse::server_error("Failed to load credits").into_response()
        }
    }
}

pub async fn get_credit_history(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
    Query(params): Query<HistoryParams>,
) -> Response {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    match state.ledger.get_history(session.user_id, limit).await {
        Ok(transactions) => {
            Json(json!({ "success": true, "transactions": transactions })).into_response()
        }
        Err(err) => {
            error!(user_id = %session.user_id, ?err, "failed to load credit history");
            JsonResponse::server_error("Failed to load credit history").into_response()
        }
    }
}

pub async fn check_credits(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
    Json(body): Json<CheckCreditsRequest>,
) -> Response {
    match state
        .credit_gate
        .check_credits(session.user_id, body.operation)
        .await
    {
        Ok(check) => Json(check).into_response(),
        Err(err) => {
            error!(user_id = %session.user_id, ?err, "credit check failed");
            JsonResponse::server_error("Failed to check credits").into_response()
        }
    }
}

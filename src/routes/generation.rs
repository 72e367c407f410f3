use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::responses::JsonResponse;
use crate::routes::auth::UnifiedAuth;
use crate::services::credit_gate::CreditGateError;
use crate::services::generation::GenerationRequest;
use crate::state::AppState;

/// Runs a paid generation through the credit gate.
pub async fn handle_generate(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
    Json(request): Json<GenerationRequest>,
) -> Response {
    if request.prompt.trim().is_empty() {
        return JsonResponse::bad_request("Prompt is required").into_response();
    }

    match state
        .credit_gate
        .run(session.user_id, &request, state.generator.as_ref())
        .await
    {
        Ok(outcome) => Json(json!({
            "success": true,
            "result": outcome.result,
            "creditsSpent": outcome.credits_spent,
            "balanceAfter": outcome.balance_after,
        }))
        .into_response(),
        Err(CreditGateError::InsufficientCredits(details)) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "success": false,
                "error": "Insufficient credits",
                "code": "INSUFFICIENT_CREDITS",
                "details": details,
            })),
        )
            .into_response(),
        Err(CreditGateError::Generation(err)) => {
            JsonResponse::bad_gateway_with_code(&err.to_string(), "GENERATION_FAILED")
                .into_response()
        }
        Err(CreditGateError::DeductionFailed { result, reason }) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "success": false,
                "error": "Credit deduction failed",
                "code": "CREDIT_DEDUCTION_FAILED",
                "generationSucceeded": true,
                "paymentFailed": true,
                "reason": reason,
                "result": result,
            })),
        )
            .into_response(),
        Err(CreditGateError::Ledger(err)) => {
            error!(user_id = %session.user_id, ?err, "credit check failed before generation");
            JsonResponse::server_error("Failed to check credits").into_response()
        }
    }
}

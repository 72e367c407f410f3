use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::services::webhook::WebhookError;
use crate::state::AppState;

fn error_status(err: &WebhookError) -> StatusCode {
    match err {
        WebhookError::MissingSignature(_) | WebhookError::Signature(_) => StatusCode::UNAUTHORIZED,
        WebhookError::InvalidJson(_)
        | WebhookError::Malformed(_)
        | WebhookError::MissingCustomer(_)
        | WebhookError::UnmappedCustomer(_) => StatusCode::BAD_REQUEST,
        WebhookError::Store(_) | WebhookError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// POST /webhooks/payment
pub async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let webhook_id = Uuid::new_v4();
    let started = Instant::now();
    let provider = state.webhooks.provider_name();

    let signature = headers
        .get(state.webhooks.signature_header())
        .and_then(|h| h.to_str().ok());

    match state.webhooks.process(signature, &body).await {
        Ok(processed) => {
            let elapsed = started.elapsed().as_millis() as u64;
            info!(
                %webhook_id,
                provider,
                event_id = %processed.event_id,
                event_type = %processed.event_type,
                action = ?processed.action,
                elapsed_ms = elapsed,
                "webhook handled"
            );
            Json(json!({
                "success": true,
                "processed": processed,
                "webhookId": webhook_id,
                "processingTimeMs": elapsed,
            }))
            .into_response()
        }
        Err(err) => {
            let status = error_status(&err);
            if err.is_permanent() {
                warn!(%webhook_id, provider, code = err.code(), %err, "webhook rejected");
            } else {
                error!(%webhook_id, provider, ?err, "webhook processing failed; provider will retry");
            }
            (
                status,
                Json(json!({
                    "error": err.to_string(),
                    "code": err.code(),
                    "webhookId": webhook_id,
                })),
            )
                .into_response()
        }
    }
}

// GET /webhooks/payment
pub async fn webhook_liveness(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "provider": state.webhooks.provider_name(),
        "message": "Payment webhook endpoint is reachable",
    }))
    .into_response()
}

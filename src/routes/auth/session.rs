use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use tracing::error;

use crate::models::session::UnifiedSession;
use crate::responses::JsonResponse;
use crate::services::session_bridge::SessionBridgeError;
use crate::state::AppState;

/// Authenticated caller, resolved through the session bridge. Accepts the
/// primary cookie, the legacy cookie, or a bearer token, tried in that order
/// until one resolves.
#[derive(Debug)]
pub struct UnifiedAuth(pub UnifiedSession);

/// Candidate tokens in lookup order. A stale primary cookie must not hide a
/// live legacy one.
fn session_tokens(parts: &Parts, state: &AppState) -> Vec<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    let bearer = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());

    let mut tokens: Vec<String> = Vec::with_capacity(3);
    let candidates = [
        jar.get(&state.cookies.primary_name).map(|c| c.value().to_string()),
        jar.get(&state.cookies.legacy_name).map(|c| c.value().to_string()),
        bearer,
    ];
    for token in candidates.into_iter().flatten() {
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

pub(crate) fn bridge_error_response(err: &SessionBridgeError) -> Response {
    match err {
        SessionBridgeError::SessionNotFound | SessionBridgeError::SessionExpired => {
            JsonResponse::unauthorized("Session expired").into_response()
        }
        SessionBridgeError::MappingConflict { .. } => JsonResponse::conflict_with_code(
            "Account is linked to a different identity",
            "MAPPING_CONFLICT",
        )
        .into_response(),
        SessionBridgeError::LegacyUserNotFound(_) | SessionBridgeError::NoLegacyIdentity(_) => {
            JsonResponse::not_found("User not found").into_response()
        }
        SessionBridgeError::Store(_) => {
            error!(?err, "session store failure");
            JsonResponse::server_error("Session lookup failed").into_response()
        }
    }
}

impl FromRequestParts<AppState> for UnifiedAuth {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let tokens = session_tokens(parts, state);
        if tokens.is_empty() {
            return Err(JsonResponse::unauthorized("Not signed in").into_response());
        }

        let mut last_error = None;
        for token in &tokens {
            match state.sessions.validate_session(token).await {
                Ok(Some(session)) if session.is_valid() => return Ok(UnifiedAuth(session)),
                Ok(_) => {}
                Err(err) => last_error = Some(err),
            }
        }

        Err(match last_error {
            Some(err) => bridge_error_response(&err),
            None => JsonResponse::unauthorized("Session expired").into_response(),
        })
    }
}

/// Current unified session, re-checked against the backing stores.
pub async fn handle_session(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
) -> Response {
    match state.sessions.sync_session_state(&session).await {
        Ok(synced) if synced.is_valid() => {
            Json(json!({ "success": true, "session": synced })).into_response()
        }
        Ok(_) => JsonResponse::unauthorized("Session expired").into_response(),
        Err(err) => bridge_error_response(&err),
    }
}

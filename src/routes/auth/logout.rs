use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use time::Duration as TimeDuration;

use super::{session::UnifiedAuth, session_cookie};
use crate::state::AppState;

/// Ends every session the caller has in either auth system and clears both
/// cookies, even when one store could not be reached.
pub async fn handle_logout_all(
    State(state): State<AppState>,
    UnifiedAuth(session): UnifiedAuth,
) -> impl IntoResponse {
    let report = state.sessions.invalidate_all_sessions(session.user_id).await;

    let mut headers = HeaderMap::new();
    for name in [&state.cookies.primary_name, &state.cookies.legacy_name] {
        if let Some(value) = session_cookie(name, "", TimeDuration::seconds(0), state.cookies.secure)
        {
            headers.append(SET_COOKIE, value);
        }
    }

    let message = if report.is_complete() {
        "Logged out of all sessions"
    } else {
        "Logged out; some sessions could not be removed"
    };
    (
        StatusCode::OK,
        headers,
        Json(json!({
            "success": true,
            "message": message,
            "complete": report.is_complete(),
            "report": report,
        })),
    )
}

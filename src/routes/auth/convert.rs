use axum::{
    extract::State,
    http::{header::SET_COOKIE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::json;
use time::OffsetDateTime;

use super::{session::bridge_error_response, session_cookie};
use crate::responses::JsonResponse;
use crate::state::AppState;

/// Swaps a live legacy session cookie for a primary session cookie.
pub async fn handle_convert_legacy(State(state): State<AppState>, jar: CookieJar) -> Response {
    let Some(legacy_token) = jar
        .get(&state.cookies.legacy_name)
        .map(|c| c.value().to_string())
    else {
        return JsonResponse::bad_request("No legacy session").into_response();
    };

    let unified = match state.sessions.convert_legacy_session_to_new(&legacy_token).await {
        Ok(unified) => unified,
        Err(err) => return bridge_error_response(&err),
    };

    let mut headers = HeaderMap::new();
    if let Some(token) = &unified.primary_token {
        let max_age = unified.expires_at - OffsetDateTime::now_utc();
        if let Some(value) =
            session_cookie(&state.cookies.primary_name, token, max_age, state.cookies.secure)
        {
            headers.insert(SET_COOKIE, value);
        }
    }

    (
        StatusCode::OK,
        headers,
        Json(json!({ "success": true, "session": unified })),
    )
        .into_response()
}

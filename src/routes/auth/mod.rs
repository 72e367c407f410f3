pub mod convert;
pub mod logout;
pub mod session;

pub use convert::handle_convert_legacy;
pub use logout::handle_logout_all;
pub use session::{handle_session, UnifiedAuth};

use axum::http::HeaderValue;
use axum_extra::extract::cookie::{Cookie, SameSite};
use time::Duration as TimeDuration;

/// `Set-Cookie` value for a session cookie. A zero max-age clears it.
pub(crate) fn session_cookie(
    name: &str,
    value: &str,
    max_age: TimeDuration,
    secure: bool,
) -> Option<HeaderValue> {
    let cookie = Cookie::build((name.to_string(), value.to_string()))
        .path("/")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .max_age(max_age)
        .build();
    HeaderValue::from_str(&cookie.to_string()).ok()
}

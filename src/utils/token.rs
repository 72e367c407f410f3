use base64::{prelude::BASE64_URL_SAFE_NO_PAD, Engine};
use rand::Rng;

/// 256-bit random session token, URL-safe so it can live in a cookie as-is.
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    BASE64_URL_SAFE_NO_PAD.encode(bytes)
}

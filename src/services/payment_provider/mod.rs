pub mod creem;
pub mod stripe;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::services::webhook::events::NormalizedEvent;

pub use creem::CreemProvider;
pub use stripe::StripeProvider;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("missing signature header")]
    MissingSignature,
    #[error("malformed signature header: {0}")]
    MalformedSignature(String),
    #[error("signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("signature mismatch")]
    InvalidSignature,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

/// Provider-specific webhook contract: how deliveries are signed and how their
/// payloads map onto [`NormalizedEvent`].
pub trait PaymentProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn signature_header(&self) -> &'static str;

    fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<(), ProviderError>;

    fn normalize(&self, payload: &Value) -> Result<NormalizedEvent, ProviderError>;
}

pub(crate) fn jget<'a>(val: &'a Value, path: &[&str]) -> Option<&'a Value> {
    let mut cur = val;
    for key in path {
        cur = cur.get(*key)?;
    }
    Some(cur)
}

pub(crate) fn extract_str(val: &Value, path: &[&str]) -> Option<String> {
    jget(val, path)?.as_str().map(str::to_string)
}

/// Accepts numbers and numeric strings; metadata values usually arrive as strings.
pub(crate) fn extract_i64(val: &Value, path: &[&str]) -> Option<i64> {
    match jget(val, path)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn extract_bool(val: &Value, path: &[&str]) -> Option<bool> {
    match jget(val, path)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub(crate) fn extract_unix(val: &Value, path: &[&str]) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(jget(val, path)?.as_i64()?).ok()
}

pub(crate) fn extract_rfc3339(val: &Value, path: &[&str]) -> Option<OffsetDateTime> {
    let raw = jget(val, path)?.as_str()?;
    OffsetDateTime::parse(raw, &time::format_description::well_known::Rfc3339).ok()
}

pub(crate) fn extract_uuid(val: &Value, paths: &[&[&str]]) -> Option<Uuid> {
    paths
        .iter()
        .filter_map(|path| jget(val, path)?.as_str())
        .find_map(|raw| Uuid::parse_str(raw).ok())
}

/// Strings or `{ "id": .. }` objects, the two shapes providers use for references.
pub(crate) fn extract_ref(val: &Value, path: &[&str]) -> Option<String> {
    match jget(val, path)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("id")?.as_str().map(str::to_string),
        _ => None,
    }
}

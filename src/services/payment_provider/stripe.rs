use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;

use super::{
    extract_bool, extract_i64, extract_ref, extract_str, extract_unix, extract_uuid, jget,
    PaymentProvider, ProviderError,
};
use crate::models::payment::{BillingInterval, PaymentStatus, PaymentType};
use crate::services::webhook::events::{EventKind, NormalizedEvent};
use crate::utils::signature::{constant_time_eq, hmac_sha256_hex};

const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// `Stripe-Signature: t=<unix>,v1=<hex hmac("<t>.<body>")>[,v1=..]`
pub struct StripeProvider {
    secret: String,
    tolerance_secs: i64,
}

impl StripeProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            tolerance_secs: DEFAULT_TOLERANCE_SECS,
        }
    }

    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let mac = hmac_sha256_hex(
            self.secret.as_bytes(),
            &[timestamp.to_string().as_bytes(), b".", payload],
        );
        format!("t={timestamp},v1={mac}")
    }

    fn verify_at(&self, payload: &[u8], header: &str, now: i64) -> Result<(), ProviderError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(value.parse::<i64>().map_err(|_| {
                        ProviderError::MalformedSignature("timestamp is not an integer".into())
                    })?)
                }
                Some(("v1", value)) => signatures.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| ProviderError::MalformedSignature("missing timestamp".into()))?;
        if signatures.is_empty() {
            return Err(ProviderError::MalformedSignature("missing v1 signature".into()));
        }
        let skew = now
            .checked_sub(timestamp)
            .map(i64::unsigned_abs)
            .ok_or(ProviderError::StaleTimestamp)?;
        if skew > self.tolerance_secs.unsigned_abs() {
            return Err(ProviderError::StaleTimestamp);
        }

        let expected = hmac_sha256_hex(
            self.secret.as_bytes(),
            &[timestamp.to_string().as_bytes(), b".", payload],
        );
        if signatures.iter().any(|sig| constant_time_eq(&expected, sig)) {
            Ok(())
        } else {
            Err(ProviderError::InvalidSignature)
        }
    }
}

fn classify(event_type: &str) -> EventKind {
    match event_type {
        "checkout.session.completed" => EventKind::SubscriptionCreated,
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "customer.subscription.paused"
        | "customer.subscription.resumed"
        | "customer.subscription.trial_will_end" => EventKind::SubscriptionUpdated,
        "customer.subscription.deleted" => EventKind::SubscriptionCanceled,
        "invoice.paid" | "invoice.payment_succeeded" => EventKind::PaymentSucceeded,
        "invoice.payment_failed" => EventKind::PaymentFailed,
        other => EventKind::Unknown(other.to_string()),
    }
}

fn fill_checkout(event: &mut NormalizedEvent, obj: &Value) {
    event.object_id = extract_str(obj, &["id"]);
    event.subscription_id = extract_ref(obj, &["subscription"]);
    event.user_id_hint = extract_uuid(
        obj,
        &[&["metadata", "user_id"], &["metadata", "userId"], &["client_reference_id"]],
    );
    if extract_str(obj, &["mode"]).as_deref() == Some("payment") {
        event.payment_type = PaymentType::OneTime;
        event.interval = Some(BillingInterval::None);
    }
    event.plan_id = extract_str(obj, &["metadata", "plan_id"]);
    event.price_id = extract_str(obj, &["metadata", "price_id"]);
    event.trial_days = extract_i64(obj, &["metadata", "trial_days"]);
    event.credits = extract_i64(obj, &["metadata", "credits"]);
    if let Some(interval) = extract_str(obj, &["metadata", "interval"]) {
        event.interval = Some(BillingInterval::parse(&interval));
    }
}

fn fill_subscription(event: &mut NormalizedEvent, obj: &Value) {
    event.subscription_id = extract_str(obj, &["id"]);
    event.status = extract_str(obj, &["status"]).and_then(|s| PaymentStatus::parse(&s));
    event.cancel_at_period_end = extract_bool(obj, &["cancel_at_period_end"]);
    event.trial_end = extract_unix(obj, &["trial_end"]);
    event.plan_id = extract_str(obj, &["metadata", "plan_id"]);

    let item = jget(obj, &["items", "data"])
        .and_then(Value::as_array)
        .and_then(|items| items.first());
    if let Some(item) = item {
        event.price_id = extract_str(item, &["price", "id"]);
        event.product_id = extract_ref(item, &["price", "product"]);
        event.interval =
            extract_str(item, &["price", "recurring", "interval"]).map(|i| BillingInterval::parse(&i));
    }

    // Newer API versions moved the period onto the subscription item.
    event.period_start = extract_unix(obj, &["current_period_start"])
        .or_else(|| item.and_then(|i| extract_unix(i, &["current_period_start"])));
    event.period_end = extract_unix(obj, &["current_period_end"])
        .or_else(|| item.and_then(|i| extract_unix(i, &["current_period_end"])));

    let previous_status = extract_str(obj, &["previous_attributes", "status"]);
    event.trial_converted = previous_status.as_deref() == Some("trialing")
        && event.status == Some(PaymentStatus::Active);
}

fn fill_invoice(event: &mut NormalizedEvent, obj: &Value) {
    event.object_id = extract_str(obj, &["id"]);
    event.subscription_id = extract_ref(obj, &["subscription"]).or_else(|| {
        extract_str(obj, &["parent", "subscription_details", "subscription"])
    });

    let line = jget(obj, &["lines", "data"])
        .and_then(Value::as_array)
        .and_then(|lines| lines.first());
    if let Some(line) = line {
        event.price_id = extract_str(line, &["price", "id"])
            .or_else(|| extract_str(line, &["pricing", "price_details", "price"]));
        event.period_start = extract_unix(line, &["period", "start"]);
        event.period_end = extract_unix(line, &["period", "end"]);
        event.interval = extract_str(line, &["price", "recurring", "interval"])
            .map(|i| BillingInterval::parse(&i));
    }
}

impl PaymentProvider for StripeProvider {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn signature_header(&self) -> &'static str {
        "Stripe-Signature"
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<(), ProviderError> {
        self.verify_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn normalize(&self, payload: &Value) -> Result<NormalizedEvent, ProviderError> {
        let event_id = extract_str(payload, &["id"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing event id".into()))?;
        let event_type = extract_str(payload, &["type"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing event type".into()))?;
        let obj = jget(payload, &["data", "object"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing data.object".into()))?;

        let mut event = NormalizedEvent::new(event_id, classify(&event_type));
        event.customer_id = extract_ref(obj, &["customer"]);
        event.metadata = obj.get("metadata").cloned().unwrap_or_else(|| Value::Object(Default::default()));

        match event.kind {
            EventKind::SubscriptionCreated => fill_checkout(&mut event, obj),
            EventKind::SubscriptionUpdated | EventKind::SubscriptionCanceled => {
                if let Some(previous) = jget(payload, &["data", "previous_attributes"]) {
                    let mut obj = obj.clone();
                    obj["previous_attributes"] = previous.clone();
                    fill_subscription(&mut event, &obj);
                } else {
                    fill_subscription(&mut event, obj);
                }
            }
            EventKind::PaymentSucceeded | EventKind::PaymentFailed => fill_invoice(&mut event, obj),
            EventKind::Unknown(_) => {}
        }

        debug!(event_id = %event.event_id, event_type = %event_type, kind = %event.kind, "normalized stripe event");
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn verifies_signed_payload() {
        let provider = StripeProvider::new("whsec_test");
        let body = br#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = provider.sign(body, now);
        assert!(provider.verify_at(body, &header, now + 10).is_ok());
    }

    #[test]
    fn rejects_tampered_body_and_wrong_secret() {
        let provider = StripeProvider::new("whsec_test");
        let now = 1_700_000_000;
        let header = provider.sign(br#"{"id":"evt_1"}"#, now);
        assert!(matches!(
            provider.verify_at(br#"{"id":"evt_2"}"#, &header, now),
            Err(ProviderError::InvalidSignature)
        ));

        let other = StripeProvider::new("whsec_other");
        assert!(matches!(
            other.verify_at(br#"{"id":"evt_1"}"#, &header, now),
            Err(ProviderError::InvalidSignature)
        ));
    }

    #[test]
    fn rejects_stale_and_malformed_headers() {
        let provider = StripeProvider::new("whsec_test");
        let body = b"{}";
        let header = provider.sign(body, 1_700_000_000);
        assert!(matches!(
            provider.verify_at(body, &header, 1_700_000_000 + 301),
            Err(ProviderError::StaleTimestamp)
        ));
        assert!(matches!(
            provider.verify_at(body, "v1=abc", 1_700_000_000),
            Err(ProviderError::MalformedSignature(_))
        ));
        assert!(matches!(
            provider.verify_at(body, "t=1700000000", 1_700_000_000),
            Err(ProviderError::MalformedSignature(_))
        ));
    }

    #[test]
    fn extreme_timestamps_are_stale_not_a_panic() {
        let provider = StripeProvider::new("whsec_test");
        assert!(matches!(
            provider.verify_signature(b"{}", "t=-9223372036854775808,v1=00"),
            Err(ProviderError::StaleTimestamp)
        ));
        assert!(matches!(
            provider.verify_at(b"{}", "t=9223372036854775807,v1=00", -10),
            Err(ProviderError::StaleTimestamp)
        ));
    }

    #[test]
    fn accepts_any_matching_v1_entry() {
        let provider = StripeProvider::new("whsec_test");
        let body = b"{}";
        let signed = provider.sign(body, 1_700_000_000);
        let header = signed.replace("t=1700000000,", "t=1700000000,v1=deadbeef,");
        assert!(provider.verify_at(body, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn normalizes_checkout_session() {
        let user_id = uuid::Uuid::new_v4();
        let payload = json!({
            "id": "evt_checkout",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_123",
                "mode": "subscription",
                "customer": "cus_1",
                "subscription": "sub_1",
                "client_reference_id": user_id.to_string(),
                "metadata": {"plan_id": "pro", "trial_days": "7", "interval": "month"}
            }}
        });
        let event = StripeProvider::new("s").normalize(&payload).unwrap();
        assert_eq!(event.kind, EventKind::SubscriptionCreated);
        assert_eq!(event.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(event.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(event.object_id.as_deref(), Some("cs_123"));
        assert_eq!(event.user_id_hint, Some(user_id));
        assert_eq!(event.trial_days, Some(7));
        assert_eq!(event.interval, Some(BillingInterval::Monthly));
        assert_eq!(event.payment_type, PaymentType::Subscription);
    }

    #[test]
    fn normalizes_one_time_checkout() {
        let payload = json!({
            "id": "evt_pack",
            "type": "checkout.session.completed",
            "data": {"object": {
                "id": "cs_pack",
                "mode": "payment",
                "customer": "cus_1",
                "metadata": {"credits": 500}
            }}
        });
        let event = StripeProvider::new("s").normalize(&payload).unwrap();
        assert_eq!(event.payment_type, PaymentType::OneTime);
        assert_eq!(event.credits, Some(500));
        assert_eq!(event.subscription_id, None);
    }

    #[test]
    fn normalizes_subscription_update_with_trial_conversion() {
        let payload = json!({
            "id": "evt_upd",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                    "cancel_at_period_end": false,
                    "current_period_start": 1_700_000_000,
                    "current_period_end": 1_702_592_000,
                    "items": {"data": [{"price": {
                        "id": "price_premium_monthly",
                        "product": "prod_premium",
                        "recurring": {"interval": "month"}
                    }}]}
                },
                "previous_attributes": {"status": "trialing"}
            }
        });
        let event = StripeProvider::new("s").normalize(&payload).unwrap();
        assert_eq!(event.kind, EventKind::SubscriptionUpdated);
        assert_eq!(event.status, Some(PaymentStatus::Active));
        assert_eq!(event.price_id.as_deref(), Some("price_premium_monthly"));
        assert_eq!(event.product_id.as_deref(), Some("prod_premium"));
        assert_eq!(event.period_end.map(|t| t.unix_timestamp()), Some(1_702_592_000));
        assert!(event.trial_converted);
    }

    #[test]
    fn normalizes_invoice_and_unknown_events() {
        let invoice = json!({
            "id": "evt_inv",
            "type": "invoice.payment_failed",
            "data": {"object": {"id": "in_1", "customer": "cus_1", "subscription": "sub_1"}}
        });
        let event = StripeProvider::new("s").normalize(&invoice).unwrap();
        assert_eq!(event.kind, EventKind::PaymentFailed);
        assert_eq!(event.object_id.as_deref(), Some("in_1"));

        let unknown = json!({"id": "evt_x", "type": "charge.refunded", "data": {"object": {}}});
        let event = StripeProvider::new("s").normalize(&unknown).unwrap();
        assert_eq!(event.kind, EventKind::Unknown("charge.refunded".into()));
    }

    #[test]
    fn missing_envelope_fields_are_malformed() {
        let provider = StripeProvider::new("s");
        assert!(matches!(
            provider.normalize(&json!({"type": "invoice.paid"})),
            Err(ProviderError::MalformedPayload(_))
        ));
        assert!(matches!(
            provider.normalize(&json!({"id": "evt_1", "type": "invoice.paid"})),
            Err(ProviderError::MalformedPayload(_))
        ));
    }
}

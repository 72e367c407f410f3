use serde_json::Value;
use tracing::debug;

use super::{
    extract_i64, extract_ref, extract_rfc3339, extract_str, extract_uuid, jget, PaymentProvider,
    ProviderError,
};
use crate::models::payment::{BillingInterval, PaymentStatus, PaymentType};
use crate::services::webhook::events::{EventKind, NormalizedEvent};
use crate::utils::signature::{constant_time_eq, hmac_sha256_hex};

/// `creem-signature: <hex hmac(body)>`
pub struct CreemProvider {
    secret: String,
}

impl CreemProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn sign(&self, payload: &[u8]) -> String {
        hmac_sha256_hex(self.secret.as_bytes(), &[payload])
    }
}

fn classify(event_type: &str) -> EventKind {
    match event_type {
        "checkout.completed" => EventKind::SubscriptionCreated,
        "subscription.active" | "subscription.update" | "subscription.trialing"
        | "subscription.paused" => EventKind::SubscriptionUpdated,
        "subscription.canceled" | "subscription.expired" => EventKind::SubscriptionCanceled,
        "subscription.paid" => EventKind::PaymentSucceeded,
        "subscription.past_due" | "subscription.unpaid" => EventKind::PaymentFailed,
        other => EventKind::Unknown(other.to_string()),
    }
}

fn fill_product(event: &mut NormalizedEvent, product: &Value) {
    event.product_id = extract_str(product, &["id"]);
    if let Some(period) = extract_str(product, &["billing_period"]) {
        event.interval = Some(BillingInterval::parse(&period));
    }
    if extract_str(product, &["billing_type"]).as_deref() == Some("onetime") {
        event.payment_type = PaymentType::OneTime;
        event.interval = Some(BillingInterval::None);
    }
}

fn fill_subscription(event: &mut NormalizedEvent, sub: &Value) {
    event.status = extract_str(sub, &["status"]).and_then(|s| PaymentStatus::parse(&s));
    event.period_start = extract_rfc3339(sub, &["current_period_start_date"]);
    event.period_end = extract_rfc3339(sub, &["current_period_end_date"]);
    event.trial_end = extract_rfc3339(sub, &["trial_end_date"]);
    if event.status == Some(PaymentStatus::Canceled) || sub.get("canceled_at").is_some_and(|v| !v.is_null()) {
        event.cancel_at_period_end = Some(true);
    }
}

impl PaymentProvider for CreemProvider {
    fn name(&self) -> &'static str {
        "creem"
    }

    fn signature_header(&self) -> &'static str {
        "creem-signature"
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<(), ProviderError> {
        let signature = signature.trim();
        if signature.is_empty() {
            return Err(ProviderError::MissingSignature);
        }
        if constant_time_eq(&self.sign(payload), signature) {
            Ok(())
        } else {
            Err(ProviderError::InvalidSignature)
        }
    }

    fn normalize(&self, payload: &Value) -> Result<NormalizedEvent, ProviderError> {
        let event_id = extract_str(payload, &["id"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing event id".into()))?;
        let event_type = extract_str(payload, &["eventType"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing eventType".into()))?;
        let obj = jget(payload, &["object"])
            .ok_or_else(|| ProviderError::MalformedPayload("missing object".into()))?;

        let mut event = NormalizedEvent::new(event_id, classify(&event_type));
        event.customer_id = extract_ref(obj, &["customer"]);
        event.metadata = obj
            .get("metadata")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        event.plan_id = extract_str(obj, &["metadata", "plan_id"]);
        if let Some(product) = obj.get("product") {
            fill_product(&mut event, product);
        }

        match event.kind {
            EventKind::SubscriptionCreated => {
                event.object_id = extract_str(obj, &["id"]);
                event.subscription_id = extract_ref(obj, &["subscription"]);
                if event.subscription_id.is_none() {
                    event.payment_type = PaymentType::OneTime;
                }
                event.user_id_hint = extract_uuid(
                    obj,
                    &[&["metadata", "user_id"], &["metadata", "userId"], &["request_id"]],
                );
                event.trial_days = extract_i64(obj, &["metadata", "trial_days"]);
                event.credits = extract_i64(obj, &["metadata", "credits"]);
                if let Some(sub) = obj.get("subscription").filter(|s| s.is_object()) {
                    fill_subscription(&mut event, sub);
                }
            }
            EventKind::SubscriptionUpdated
            | EventKind::SubscriptionCanceled
            | EventKind::PaymentSucceeded
            | EventKind::PaymentFailed => {
                event.subscription_id = extract_str(obj, &["id"]);
                event.object_id = extract_str(obj, &["last_transaction_id"])
                    .or_else(|| extract_str(obj, &["last_transaction", "id"]));
                fill_subscription(&mut event, obj);
                event.trial_converted = event_type == "subscription.active"
                    && extract_str(obj, &["metadata", "converted_from_trial"]).as_deref()
                        == Some("true");
            }
            EventKind::Unknown(_) => {}
        }

        debug!(event_id = %event.event_id, event_type = %event_type, kind = %event.kind, "normalized creem event");
        Ok(event)
    }
}

use core::fmt;

use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::payment::{BillingInterval, PaymentStatus, PaymentType};

/// Internal event taxonomy every provider payload is normalized into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Checkout completed: first subscription, upgrade via new checkout, or a
    /// one-time purchase.
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PaymentSucceeded,
    PaymentFailed,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::SubscriptionCreated => "subscription_created",
            EventKind::SubscriptionUpdated => "subscription_updated",
            EventKind::SubscriptionCanceled => "subscription_canceled",
            EventKind::PaymentSucceeded => "payment_succeeded",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    /// Checkout session id for created events, invoice/order id for payments.
    pub object_id: Option<String>,
    /// User id carried by checkout metadata (`client_reference_id` and friends).
    pub user_id_hint: Option<Uuid>,
    pub payment_type: PaymentType,
    pub status: Option<PaymentStatus>,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub plan_id: Option<String>,
    pub interval: Option<BillingInterval>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_days: Option<i64>,
    pub trial_end: Option<OffsetDateTime>,
    /// Provider explicitly flagged a trial-to-paid conversion.
    pub trial_converted: bool,
    /// Credit pack size for one-time purchases.
    pub credits: Option<i64>,
    pub metadata: Value,
}

impl NormalizedEvent {
    pub fn new(event_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            event_id: event_id.into(),
            kind,
            customer_id: None,
            subscription_id: None,
            object_id: None,
            user_id_hint: None,
            payment_type: PaymentType::Subscription,
            status: None,
            price_id: None,
            product_id: None,
            plan_id: None,
            interval: None,
            period_start: None,
            period_end: None,
            cancel_at_period_end: None,
            trial_days: None,
            trial_end: None,
            trial_converted: false,
            credits: None,
            metadata: Value::Object(Default::default()),
        }
    }

    /// Plan identifier used for tier comparison: explicit plan id first, then
    /// the provider price and product ids.
    pub fn plan_key(&self) -> Option<&str> {
        self.plan_id
            .as_deref()
            .or(self.price_id.as_deref())
            .or(self.product_id.as_deref())
    }
}

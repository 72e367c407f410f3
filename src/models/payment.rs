use core::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Incomplete,
    IncompleteExpired,
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Paused,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 8] = [
        PaymentStatus::Incomplete,
        PaymentStatus::IncompleteExpired,
        PaymentStatus::Trialing,
        PaymentStatus::Active,
        PaymentStatus::PastDue,
        PaymentStatus::Canceled,
        PaymentStatus::Unpaid,
        PaymentStatus::Paused,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Incomplete => "incomplete",
            PaymentStatus::IncompleteExpired => "incomplete_expired",
            PaymentStatus::Trialing => "trialing",
            PaymentStatus::Active => "active",
            PaymentStatus::PastDue => "past_due",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paused => "paused",
        }
    }

    /// Parses provider status strings, including the common `cancelled`
    /// spelling and `expired` (treated as canceled).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "incomplete" => Some(PaymentStatus::Incomplete),
            "incomplete_expired" => Some(PaymentStatus::IncompleteExpired),
            "trialing" => Some(PaymentStatus::Trialing),
            "active" => Some(PaymentStatus::Active),
            "past_due" => Some(PaymentStatus::PastDue),
            "canceled" | "cancelled" | "expired" => Some(PaymentStatus::Canceled),
            "unpaid" => Some(PaymentStatus::Unpaid),
            "paused" => Some(PaymentStatus::Paused),
            _ => None,
        }
    }

    pub fn allowed_transitions(&self) -> &'static [PaymentStatus] {
        use PaymentStatus::*;
        match self {
            Incomplete => &[Active, Canceled, IncompleteExpired],
            IncompleteExpired => &[Active, Canceled],
            Trialing => &[Active, Canceled, PastDue],
            Active => &[Canceled, PastDue, Unpaid, Paused],
            PastDue => &[Active, Canceled, Unpaid],
            Unpaid => &[Active, Canceled],
            Paused => &[Active, Canceled],
            Canceled => &[],
        }
    }

    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Statuses that still entitle the user to the subscription.
    pub fn is_entitled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Active | PaymentStatus::Trialing | PaymentStatus::PastDue
        )
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "payment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    OneTime,
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[sqlx(type_name = "billing_interval", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Monthly,
    Yearly,
    None,
}

impl BillingInterval {
    /// Understands `month`, `monthly`, `every-month`, `year`, `yearly`, `every-year`.
    pub fn parse(value: &str) -> Self {
        let lowered = value.trim().to_ascii_lowercase();
        if lowered.contains("year") || lowered == "annual" {
            BillingInterval::Yearly
        } else if lowered.contains("month") {
            BillingInterval::Monthly
        } else {
            BillingInterval::None
        }
    }

    pub fn period(&self) -> Option<time::Duration> {
        match self {
            BillingInterval::Monthly => Some(time::Duration::days(30)),
            BillingInterval::Yearly => Some(time::Duration::days(365)),
            BillingInterval::None => None,
        }
    }
}

/// Lifecycle classification recorded on every applied payment event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    TrialStarted,
    Created,
    Upgraded,
    Downgraded,
    Renewed,
    TrialConverted,
    Updated,
    Cancelled,
    PaymentSucceeded,
    PaymentFailed,
    Quarantined,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::TrialStarted => "trial_started",
            LifecycleEvent::Created => "created",
            LifecycleEvent::Upgraded => "upgraded",
            LifecycleEvent::Downgraded => "downgraded",
            LifecycleEvent::Renewed => "renewed",
            LifecycleEvent::TrialConverted => "trial_converted",
            LifecycleEvent::Updated => "updated",
            LifecycleEvent::Cancelled => "cancelled",
            LifecycleEvent::PaymentSucceeded => "payment_succeeded",
            LifecycleEvent::PaymentFailed => "payment_failed",
            LifecycleEvent::Quarantined => "quarantined",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    pub id: Uuid,
    pub provider: String,
    pub user_id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub plan_id: Option<String>,
    pub previous_plan_id: Option<String>,
    pub payment_type: PaymentType,
    pub interval: BillingInterval,
    pub status: PaymentStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl PaymentRecord {
    /// Active for entitlement purposes: an entitled status that is not
    /// scheduled to lapse at period end.
    pub fn is_active_subscription(&self) -> bool {
        self.status.is_entitled() && !self.cancel_at_period_end
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentRecord {
    pub provider: String,
    pub user_id: Uuid,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub plan_id: Option<String>,
    pub payment_type: PaymentType,
    pub interval: BillingInterval,
    pub status: PaymentStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: Value,
}

impl NewPaymentRecord {
    pub fn into_record(self, id: Uuid, now: OffsetDateTime) -> PaymentRecord {
        PaymentRecord {
            id,
            provider: self.provider,
            user_id: self.user_id,
            customer_id: self.customer_id,
            subscription_id: self.subscription_id,
            price_id: self.price_id,
            product_id: self.product_id,
            plan_id: self.plan_id,
            previous_plan_id: None,
            payment_type: self.payment_type,
            interval: self.interval,
            status: self.status,
            period_start: self.period_start,
            period_end: self.period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            trial_start: self.trial_start,
            trial_end: self.trial_end,
            metadata: self.metadata,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update; `None` leaves the stored column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentRecordUpdate {
    pub subscription_id: Option<String>,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub plan_id: Option<String>,
    pub previous_plan_id: Option<String>,
    pub interval: Option<BillingInterval>,
    pub status: Option<PaymentStatus>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
    pub trial_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub metadata: Option<Value>,
}

impl PaymentRecordUpdate {
    pub fn is_empty(&self) -> bool {
        *self == PaymentRecordUpdate::default()
    }

    pub fn apply_to(&self, record: &mut PaymentRecord, now: OffsetDateTime) {
        if let Some(v) = &self.subscription_id {
            record.subscription_id = Some(v.clone());
        }
        if let Some(v) = &self.price_id {
            record.price_id = Some(v.clone());
        }
        if let Some(v) = &self.product_id {
            record.product_id = Some(v.clone());
        }
        if let Some(v) = &self.plan_id {
            record.plan_id = Some(v.clone());
        }
        if let Some(v) = &self.previous_plan_id {
            record.previous_plan_id = Some(v.clone());
        }
        if let Some(v) = self.interval {
            record.interval = v;
        }
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = self.period_start {
            record.period_start = Some(v);
        }
        if let Some(v) = self.period_end {
            record.period_end = Some(v);
        }
        if let Some(v) = self.cancel_at_period_end {
            record.cancel_at_period_end = v;
        }
        if let Some(v) = self.trial_start {
            record.trial_start = Some(v);
        }
        if let Some(v) = self.trial_end {
            record.trial_end = Some(v);
        }
        if let Some(v) = &self.metadata {
            record.metadata = v.clone();
        }
        record.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub event_type: String,
    pub provider_event_id: String,
    pub event_data: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPaymentEvent {
    pub payment_id: Uuid,
    pub event_type: String,
    pub provider_event_id: String,
    pub event_data: Value,
}

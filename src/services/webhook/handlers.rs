//! One pure function per event kind. Each turns a normalized event plus the
//! stored record into the writes for a single atomic unit; nothing here touches
//! storage.

use serde_json::json;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::payment_repository::{PaymentWrite, WebhookEffect};
use crate::models::credit::{CreditMutation, CreditSource};
use crate::models::payment::{
    BillingInterval, LifecycleEvent, NewPaymentRecord, PaymentRecord, PaymentRecordUpdate,
    PaymentStatus, PaymentType,
};
use crate::models::plan::{classify_tier_change, PlanTier, TierChange};
use crate::services::webhook::events::NormalizedEvent;

/// Effect plus the status change it makes, so the caller can run the
/// transition check before committing.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEffect {
    pub effect: WebhookEffect,
    pub transition: Option<(PaymentStatus, PaymentStatus)>,
}

impl PlannedEffect {
    fn new(event: &NormalizedEvent, lifecycle: LifecycleEvent, payment: PaymentWrite) -> Self {
        Self {
            effect: WebhookEffect {
                provider_event_id: event.event_id.clone(),
                lifecycle,
                event_data: event_data(event),
                payment,
                credit_grant: None,
            },
            transition: None,
        }
    }

    fn with_transition(mut self, from: PaymentStatus, to: PaymentStatus) -> Self {
        self.transition = Some((from, to));
        self
    }

    fn with_grant(mut self, grant: Option<CreditMutation>) -> Self {
        self.effect.credit_grant = grant;
        self
    }

    /// Replaces the state change with a bare event row for manual review.
    pub fn quarantine(self, payment_id: Uuid) -> Self {
        let (from, to) = self.transition.unwrap_or((PaymentStatus::Active, PaymentStatus::Active));
        let mut event_data = self.effect.event_data;
        event_data["quarantine"] = json!({"from": from, "to": to});
        Self {
            effect: WebhookEffect {
                lifecycle: LifecycleEvent::Quarantined,
                event_data,
                payment: PaymentWrite::RecordOnly { payment_id },
                credit_grant: None,
                ..self.effect
            },
            transition: None,
        }
    }
}

fn event_data(event: &NormalizedEvent) -> serde_json::Value {
    json!({
        "kind": event.kind.as_str(),
        "customerId": event.customer_id,
        "subscriptionId": event.subscription_id,
        "objectId": event.object_id,
        "status": event.status,
        "planId": event.plan_key(),
        "metadata": event.metadata,
    })
}

fn record_plan_key(record: &PaymentRecord) -> Option<&str> {
    record
        .plan_id
        .as_deref()
        .or(record.price_id.as_deref())
        .or(record.product_id.as_deref())
}

/// Longest trial a checkout may request; larger values are clamped.
const MAX_TRIAL_DAYS: i64 = 365;

fn period_end_from(start: OffsetDateTime, interval: BillingInterval) -> Option<OffsetDateTime> {
    interval.period().and_then(|period| start.checked_add(period))
}

/// Checkout completed. Inserts a record when the user has no live
/// subscription, otherwise moves the live one onto the new plan and keeps the
/// previous tier.
pub fn subscription_created(
    event: &NormalizedEvent,
    provider: &str,
    user_id: Uuid,
    existing: Option<&PaymentRecord>,
    now: OffsetDateTime,
) -> PlannedEffect {
    if event.payment_type == PaymentType::OneTime {
        return one_time_purchase(event, provider, user_id);
    }

    let interval = event.interval.unwrap_or(BillingInterval::Monthly);
    let trial_end = event
        .trial_days
        .filter(|days| *days > 0)
        .and_then(|days| now.checked_add(Duration::days(days.min(MAX_TRIAL_DAYS))));

    let (status, trial_start, trial_end, period_start) = match trial_end {
        Some(trial_end) => (PaymentStatus::Trialing, Some(now), Some(trial_end), trial_end),
        None => (
            event.status.unwrap_or(PaymentStatus::Active),
            None,
            event.trial_end,
            event.period_start.unwrap_or(now),
        ),
    };
    let period_end = match trial_start {
        Some(_) => period_end_from(period_start, interval),
        None => event.period_end.or_else(|| period_end_from(period_start, interval)),
    };

    match existing {
        None => {
            let lifecycle = if status == PaymentStatus::Trialing {
                LifecycleEvent::TrialStarted
            } else {
                LifecycleEvent::Created
            };
            let record = NewPaymentRecord {
                provider: provider.to_string(),
                user_id,
                customer_id: event.customer_id.clone().unwrap_or_default(),
                subscription_id: event.subscription_id.clone(),
                price_id: event.price_id.clone(),
                product_id: event.product_id.clone(),
                plan_id: event.plan_id.clone(),
                payment_type: PaymentType::Subscription,
                interval,
                status,
                period_start: Some(period_start),
                period_end,
                cancel_at_period_end: false,
                trial_start,
                trial_end,
                metadata: event.metadata.clone(),
            };
            PlannedEffect::new(event, lifecycle, PaymentWrite::Insert(record))
        }
        Some(current) => {
            let lifecycle = match event
                .plan_key()
                .map(|next| classify_tier_change(record_plan_key(current), next))
            {
                Some(TierChange::Upgrade) => LifecycleEvent::Upgraded,
                Some(TierChange::Downgrade) => LifecycleEvent::Downgraded,
                _ if status == PaymentStatus::Trialing => LifecycleEvent::TrialStarted,
                _ => LifecycleEvent::Renewed,
            };
            let changes = PaymentRecordUpdate {
                subscription_id: event.subscription_id.clone(),
                price_id: event.price_id.clone(),
                product_id: event.product_id.clone(),
                plan_id: event.plan_id.clone(),
                previous_plan_id: record_plan_key(current).map(str::to_string),
                interval: Some(interval),
                status: Some(status),
                period_start: Some(period_start),
                period_end,
                cancel_at_period_end: Some(false),
                trial_start,
                trial_end,
                metadata: None,
            };
            PlannedEffect::new(
                event,
                lifecycle,
                PaymentWrite::Update {
                    payment_id: current.id,
                    changes,
                },
            )
            .with_transition(current.status, status)
        }
    }
}

fn one_time_purchase(event: &NormalizedEvent, provider: &str, user_id: Uuid) -> PlannedEffect {
    let record = NewPaymentRecord {
        provider: provider.to_string(),
        user_id,
        customer_id: event.customer_id.clone().unwrap_or_default(),
        subscription_id: None,
        price_id: event.price_id.clone(),
        product_id: event.product_id.clone(),
        plan_id: event.plan_id.clone(),
        payment_type: PaymentType::OneTime,
        interval: BillingInterval::None,
        status: PaymentStatus::Active,
        period_start: None,
        period_end: None,
        cancel_at_period_end: false,
        trial_start: None,
        trial_end: None,
        metadata: event.metadata.clone(),
    };

    let checkout_id = event.object_id.as_deref().unwrap_or(&event.event_id);
    let grant = event.credits.filter(|c| *c > 0).map(|credits| {
        CreditMutation::new(user_id, credits, CreditSource::CreditPurchase, "credit pack purchase")
            .with_reference(format!("checkout:{checkout_id}"))
            .with_metadata(json!({"eventId": event.event_id, "productId": event.product_id}))
    });

    PlannedEffect::new(event, LifecycleEvent::Created, PaymentWrite::Insert(record)).with_grant(grant)
}

/// Trial conversion wins over a tier change, which wins over a plain renewal.
pub fn subscription_updated(
    event: &NormalizedEvent,
    current: &PaymentRecord,
    now: OffsetDateTime,
) -> PlannedEffect {
    let mut status = event.status.unwrap_or(current.status);

    let trial_converted = current.status == PaymentStatus::Trialing
        && status != PaymentStatus::Canceled
        && (event.trial_converted
            || status == PaymentStatus::Active
            || current.trial_end.is_some_and(|end| now >= end));
    if trial_converted && status == PaymentStatus::Trialing {
        status = PaymentStatus::Active;
    }

    let renewed = matches!(
        (event.period_end, current.period_end),
        (Some(next), Some(previous)) if next > previous
    );

    let tier_change = event
        .plan_key()
        .map(|next| classify_tier_change(record_plan_key(current), next))
        .unwrap_or(TierChange::Unchanged);

    let lifecycle = if trial_converted {
        LifecycleEvent::TrialConverted
    } else {
        match tier_change {
            TierChange::Upgrade => LifecycleEvent::Upgraded,
            TierChange::Downgrade => LifecycleEvent::Downgraded,
            TierChange::Unchanged if renewed => LifecycleEvent::Renewed,
            TierChange::Unchanged => LifecycleEvent::Updated,
        }
    };

    let changes = PaymentRecordUpdate {
        price_id: event.price_id.clone(),
        product_id: event.product_id.clone(),
        plan_id: event.plan_id.clone(),
        previous_plan_id: match tier_change {
            TierChange::Unchanged => None,
            _ => record_plan_key(current).map(str::to_string),
        },
        interval: event.interval,
        status: Some(status),
        period_start: event.period_start,
        period_end: event.period_end,
        cancel_at_period_end: event.cancel_at_period_end,
        trial_end: event.trial_end,
        ..Default::default()
    };

    PlannedEffect::new(
        event,
        lifecycle,
        PaymentWrite::Update {
            payment_id: current.id,
            changes,
        },
    )
    .with_transition(current.status, status)
}

pub fn subscription_canceled(event: &NormalizedEvent, current: &PaymentRecord) -> PlannedEffect {
    let changes = PaymentRecordUpdate {
        status: Some(PaymentStatus::Canceled),
        cancel_at_period_end: Some(true),
        period_end: event.period_end,
        ..Default::default()
    };
    PlannedEffect::new(
        event,
        LifecycleEvent::Cancelled,
        PaymentWrite::Update {
            payment_id: current.id,
            changes,
        },
    )
    .with_transition(current.status, PaymentStatus::Canceled)
}

/// Restores delinquent records to active and grants the plan's credits for
/// the paid period. Trial invoices grant nothing.
pub fn payment_succeeded(event: &NormalizedEvent, current: &PaymentRecord) -> PlannedEffect {
    let status = match current.status {
        PaymentStatus::PastDue
        | PaymentStatus::Unpaid
        | PaymentStatus::Incomplete
        | PaymentStatus::IncompleteExpired => PaymentStatus::Active,
        other => other,
    };

    let changes = PaymentRecordUpdate {
        status: Some(status),
        period_start: event.period_start,
        period_end: event.period_end,
        ..Default::default()
    };

    let interval = event.interval.unwrap_or(current.interval);
    let tier = event
        .plan_key()
        .or(record_plan_key(current))
        .and_then(PlanTier::parse);
    let invoice_id = event.object_id.as_deref().unwrap_or(&event.event_id);
    let grant = tier
        .filter(|_| current.status != PaymentStatus::Trialing)
        .map(|tier| (tier, tier.credits_for_interval(interval)))
        .filter(|(_, credits)| *credits > 0)
        .map(|(tier, credits)| {
            CreditMutation::new(
                current.user_id,
                credits,
                CreditSource::SubscriptionGrant,
                format!("{tier} plan credits"),
            )
            .with_reference(format!("payment:{invoice_id}"))
            .with_metadata(json!({
                "eventId": event.event_id,
                "subscriptionId": current.subscription_id,
                "plan": tier.as_str(),
            }))
        });

    let planned = PlannedEffect::new(
        event,
        LifecycleEvent::PaymentSucceeded,
        PaymentWrite::Update {
            payment_id: current.id,
            changes,
        },
    )
    .with_grant(grant);

    if status != current.status {
        planned.with_transition(current.status, status)
    } else {
        planned
    }
}

pub fn payment_failed(event: &NormalizedEvent, current: &PaymentRecord) -> PlannedEffect {
    let changes = PaymentRecordUpdate {
        status: Some(PaymentStatus::PastDue),
        ..Default::default()
    };
    PlannedEffect::new(
        event,
        LifecycleEvent::PaymentFailed,
        PaymentWrite::Update {
            payment_id: current.id,
            changes,
        },
    )
    .with_transition(current.status, PaymentStatus::PastDue)
}

pub mod events;
pub mod handlers;

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::auth_repository::PrimaryAuthRepository;
use crate::db::payment_repository::{ApplyOutcome, PaymentWrite};
use crate::models::credit::GrantOutcome;
use crate::models::payment::{PaymentRecord, PaymentStatus, PaymentType};
use crate::models::plan::PlanTier;
use crate::services::notifier::SubscriptionNotifier;
use crate::services::payment_provider::{PaymentProvider, ProviderError};
use crate::services::payment_store::{PaymentStore, PaymentStoreError, TransitionDecision};
use events::{EventKind, NormalizedEvent};
use handlers::PlannedEffect;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing {0} header")]
    MissingSignature(&'static str),
    #[error("signature verification failed: {0}")]
    Signature(ProviderError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("event {0} carries no customer id")]
    MissingCustomer(String),
    #[error("customer {0} is not mapped to a known user")]
    UnmappedCustomer(String),
    #[error("payment store error: {0}")]
    Store(#[from] PaymentStoreError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl WebhookError {
    /// Permanent failures: a retry of the same delivery cannot succeed.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, WebhookError::Store(_) | WebhookError::Database(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::MissingSignature(_) => "MISSING_SIGNATURE",
            WebhookError::Signature(_) => "INVALID_SIGNATURE",
            WebhookError::InvalidJson(_) => "INVALID_JSON",
            WebhookError::Malformed(_) => "MALFORMED_EVENT",
            WebhookError::MissingCustomer(_) => "MISSING_CUSTOMER",
            WebhookError::UnmappedCustomer(_) => "UNKNOWN_CUSTOMER",
            WebhookError::Store(_) | WebhookError::Database(_) => "PROCESSING_FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookAction {
    Applied,
    Duplicate,
    Quarantined,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEvent {
    pub event_id: String,
    pub event_type: String,
    pub action: WebhookAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credits_granted: Option<i64>,
}

impl ProcessedEvent {
    fn skipped(event: &NormalizedEvent, action: WebhookAction) -> Self {
        Self {
            event_id: event.event_id.clone(),
            event_type: event.kind.to_string(),
            action,
            lifecycle: None,
            payment_id: None,
            user_id: None,
            status: None,
            credits_granted: None,
        }
    }
}

/// Verifies, normalizes, deduplicates and applies provider webhook deliveries.
#[derive(Clone)]
pub struct WebhookReconciler {
    provider: Arc<dyn PaymentProvider>,
    store: PaymentStore,
    users: Arc<dyn PrimaryAuthRepository>,
    notifier: Arc<dyn SubscriptionNotifier>,
}

impl WebhookReconciler {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        store: PaymentStore,
        users: Arc<dyn PrimaryAuthRepository>,
        notifier: Arc<dyn SubscriptionNotifier>,
    ) -> Self {
        Self {
            provider,
            store,
            users,
            notifier,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn signature_header(&self) -> &'static str {
        self.provider.signature_header()
    }

    pub async fn process(
        &self,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<ProcessedEvent, WebhookError> {
        let signature =
            signature.ok_or(WebhookError::MissingSignature(self.provider.signature_header()))?;
        self.provider
            .verify_signature(body, signature)
            .map_err(WebhookError::Signature)?;

        let payload: serde_json::Value = serde_json::from_slice(body)?;
        let event = self.provider.normalize(&payload).map_err(|err| match err {
            ProviderError::MalformedPayload(msg) => WebhookError::Malformed(msg),
            other => WebhookError::Malformed(other.to_string()),
        })?;

        if let EventKind::Unknown(event_type) = &event.kind {
            info!(event_id = %event.event_id, event_type, "ignoring unhandled event type");
            return Ok(ProcessedEvent::skipped(&event, WebhookAction::Ignored));
        }

        let customer_id = event
            .customer_id
            .clone()
            .ok_or_else(|| WebhookError::MissingCustomer(event.event_id.clone()))?;
        let user_id = self.resolve_user(&event, &customer_id).await?;

        if self.store.is_event_processed(&event.event_id).await? {
            info!(event_id = %event.event_id, "webhook event already processed");
            return Ok(ProcessedEvent::skipped(&event, WebhookAction::Duplicate));
        }

        let Some(planned) = self.plan(&event, user_id).await? else {
            warn!(
                event_id = %event.event_id,
                kind = %event.kind,
                subscription_id = event.subscription_id.as_deref(),
                "no payment record for event, ignoring"
            );
            return Ok(ProcessedEvent::skipped(&event, WebhookAction::Ignored));
        };

        let (planned, quarantined) = self.check_transition(&event, planned);

        let outcome = self.store.apply_webhook_effect(&planned.effect).await?;
        let ApplyOutcome::Applied {
            payment,
            credit_grant,
        } = outcome
        else {
            info!(event_id = %event.event_id, "concurrent delivery already applied event");
            return Ok(ProcessedEvent::skipped(&event, WebhookAction::Duplicate));
        };

        if event.kind == EventKind::SubscriptionCreated {
            if let Err(err) = self
                .store
                .link_customer(self.provider.name(), &customer_id, payment.user_id)
                .await
            {
                warn!(%customer_id, ?err, "failed to link provider customer");
            }
        }

        let credits_granted = match credit_grant {
            Some(GrantOutcome::Granted { transaction, .. }) => Some(transaction.amount),
            _ => None,
        };

        info!(
            event_id = %event.event_id,
            kind = %event.kind,
            lifecycle = %planned.effect.lifecycle,
            payment_id = %payment.id,
            user_id = %payment.user_id,
            status = %payment.status,
            credits_granted,
            "webhook event applied"
        );

        if !quarantined {
            self.notify(&payment).await;
        }

        Ok(ProcessedEvent {
            event_id: event.event_id.clone(),
            event_type: event.kind.to_string(),
            action: if quarantined {
                WebhookAction::Quarantined
            } else {
                WebhookAction::Applied
            },
            lifecycle: Some(planned.effect.lifecycle.to_string()),
            payment_id: Some(payment.id),
            user_id: Some(payment.user_id),
            status: Some(payment.status),
            credits_granted,
        })
    }

    /// Customer link first, then an existing payment row for the customer.
    /// Checkout events may introduce a new customer for a user this system
    /// already knows.
    async fn resolve_user(
        &self,
        event: &NormalizedEvent,
        customer_id: &str,
    ) -> Result<Uuid, WebhookError> {
        if let Some(user_id) = self
            .store
            .find_user_id_by_customer_id(self.provider.name(), customer_id)
            .await?
        {
            return Ok(user_id);
        }
        if let Some(record) = self.store.find_by_customer_id(customer_id).await? {
            return Ok(record.user_id);
        }
        if event.kind == EventKind::SubscriptionCreated {
            if let Some(hint) = event.user_id_hint {
                if self.users.find_user(hint).await?.is_some() {
                    return Ok(hint);
                }
            }
        }
        warn!(event_id = %event.event_id, customer_id, "webhook for unmapped customer");
        Err(WebhookError::UnmappedCustomer(customer_id.to_string()))
    }

    async fn find_record(
        &self,
        event: &NormalizedEvent,
    ) -> Result<Option<PaymentRecord>, WebhookError> {
        if let Some(subscription_id) = event.subscription_id.as_deref() {
            if let Some(record) = self.store.find_by_subscription_id(subscription_id).await? {
                return Ok(Some(record));
            }
        }
        match event.customer_id.as_deref() {
            Some(customer_id) => Ok(self
                .store
                .find_by_customer_id(customer_id)
                .await?
                .filter(|r| r.payment_type == PaymentType::Subscription)),
            None => Ok(None),
        }
    }

    async fn plan(
        &self,
        event: &NormalizedEvent,
        user_id: Uuid,
    ) -> Result<Option<PlannedEffect>, WebhookError> {
        let now = OffsetDateTime::now_utc();
        let planned = match event.kind {
            EventKind::SubscriptionCreated => {
                let existing = match event.payment_type {
                    PaymentType::Subscription => {
                        self.store.find_active_subscription_by_user_id(user_id).await?
                    }
                    PaymentType::OneTime => None,
                };
                Some(handlers::subscription_created(
                    event,
                    self.provider.name(),
                    user_id,
                    existing.as_ref(),
                    now,
                ))
            }
            EventKind::SubscriptionUpdated => self
                .find_record(event)
                .await?
                .map(|record| handlers::subscription_updated(event, &record, now)),
            EventKind::SubscriptionCanceled => self
                .find_record(event)
                .await?
                .map(|record| handlers::subscription_canceled(event, &record)),
            EventKind::PaymentSucceeded => self
                .find_record(event)
                .await?
                .map(|record| handlers::payment_succeeded(event, &record)),
            EventKind::PaymentFailed => self
                .find_record(event)
                .await?
                .map(|record| handlers::payment_failed(event, &record)),
            EventKind::Unknown(_) => None,
        };
        Ok(planned)
    }

    fn check_transition(
        &self,
        event: &NormalizedEvent,
        planned: PlannedEffect,
    ) -> (PlannedEffect, bool) {
        let Some((from, to)) = planned.transition else {
            return (planned, false);
        };
        let payment_id = match &planned.effect.payment {
            PaymentWrite::Update { payment_id, .. } | PaymentWrite::RecordOnly { payment_id } => {
                *payment_id
            }
            PaymentWrite::Insert(_) => return (planned, false),
        };
        match self
            .store
            .transition_decision(event.subscription_id.as_deref(), from, to)
        {
            TransitionDecision::Apply => (planned, false),
            TransitionDecision::Quarantine => (planned.quarantine(payment_id), true),
        }
    }

    async fn notify(&self, payment: &PaymentRecord) {
        let plan = if payment.status.is_entitled() {
            payment
                .plan_id
                .as_deref()
                .or(payment.price_id.as_deref())
                .and_then(PlanTier::parse)
                .unwrap_or(PlanTier::Free)
        } else {
            PlanTier::Free
        };
        if let Err(err) = self
            .notifier
            .subscription_changed(payment.user_id, plan.as_str(), payment.status)
            .await
        {
            error!(user_id = %payment.user_id, ?err, "failed to notify subscription change");
        }
    }
}

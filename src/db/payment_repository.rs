use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::credit::{CreditMutation, GrantOutcome};
use crate::models::payment::{
    LifecycleEvent, NewPaymentEvent, NewPaymentRecord, PaymentRecord, PaymentRecordUpdate,
    PaymentStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentWrite {
    Insert(NewPaymentRecord),
    Update {
        payment_id: Uuid,
        changes: PaymentRecordUpdate,
    },
    /// Only the dedup/lifecycle row is written.
    RecordOnly { payment_id: Uuid },
}

/// Everything one webhook event changes, committed as a single unit together
/// with its `payment_event` dedup row.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEffect {
    pub provider_event_id: String,
    pub lifecycle: LifecycleEvent,
    pub event_data: Value,
    pub payment: PaymentWrite,
    pub credit_grant: Option<CreditMutation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied {
        payment: PaymentRecord,
        credit_grant: Option<GrantOutcome>,
    },
    /// Another delivery of the same provider event already committed.
    Duplicate,
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, record: &NewPaymentRecord) -> Result<PaymentRecord, sqlx::Error>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, sqlx::Error>;

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error>;

    /// Most recently created record for the provider customer.
    async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error>;

    /// Newest first.
    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PaymentRecord>, sqlx::Error>;

    async fn update(
        &self,
        id: Uuid,
        changes: &PaymentRecordUpdate,
    ) -> Result<Option<PaymentRecord>, sqlx::Error>;

    async fn update_status_by_subscription_id(
        &self,
        subscription_id: &str,
        status: PaymentStatus,
        metadata: Option<&Value>,
    ) -> Result<Option<PaymentRecord>, sqlx::Error>;

    /// Moves every non-terminal record of the user to `canceled`.
    async fn cancel_user_subscriptions(&self, user_id: Uuid) -> Result<u64, sqlx::Error>;

    /// Returns false when the provider event id was already recorded.
    async fn create_event(&self, event: &NewPaymentEvent) -> Result<bool, sqlx::Error>;

    async fn is_event_processed(&self, provider_event_id: &str) -> Result<bool, sqlx::Error>;

    async fn find_user_id_by_customer_id(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn link_customer(
        &self,
        provider: &str,
        customer_id: &str,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error>;

    async fn apply_webhook_effect(
        &self,
        effect: &WebhookEffect,
    ) -> Result<ApplyOutcome, sqlx::Error>;
}

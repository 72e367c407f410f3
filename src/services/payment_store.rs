use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::payment_repository::{ApplyOutcome, PaymentRepository, WebhookEffect};
use crate::models::payment::{
    NewPaymentEvent, NewPaymentRecord, PaymentRecord, PaymentRecordUpdate, PaymentStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum PaymentStoreError {
    #[error("no payment record for subscription {0}")]
    NotFound(String),
    #[error("status transition {from} -> {to} quarantined for review")]
    Quarantined {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// What to do with a status change that is not in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPolicy {
    /// The provider is authoritative: warn and apply.
    Permissive,
    /// Leave state untouched and hold the event for manual review.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionDecision {
    Apply,
    Quarantine,
}

#[derive(Clone)]
pub struct PaymentStore {
    repo: Arc<dyn PaymentRepository>,
    policy: TransitionPolicy,
}

impl PaymentStore {
    pub fn new(repo: Arc<dyn PaymentRepository>, policy: TransitionPolicy) -> Self {
        Self { repo, policy }
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Checks `from -> to` against the transition table. Same-state updates
    /// are not transitions. Violations are logged with machine-readable fields.
    pub fn transition_decision(
        &self,
        subscription_id: Option<&str>,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> TransitionDecision {
        if from == to || from.can_transition_to(to) {
            return TransitionDecision::Apply;
        }
        match self.policy {
            TransitionPolicy::Permissive => {
                warn!(
                    transition_violation = true,
                    from = %from,
                    to = %to,
                    subscription_id,
                    "status transition not in table, applying provider state"
                );
                TransitionDecision::Apply
            }
            TransitionPolicy::Strict => {
                error!(
                    transition_violation = true,
                    quarantined = true,
                    from = %from,
                    to = %to,
                    subscription_id,
                    "status transition not in table, quarantining"
                );
                TransitionDecision::Quarantine
            }
        }
    }

    pub async fn create(&self, record: &NewPaymentRecord) -> Result<PaymentRecord, PaymentStoreError> {
        let created = self.repo.create(record).await?;
        info!(payment_id = %created.id, user_id = %created.user_id, status = %created.status, "payment record created");
        Ok(created)
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        Ok(self.repo.find_by_id(id).await?)
    }

    pub async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        Ok(self.repo.find_by_subscription_id(subscription_id).await?)
    }

    pub async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        Ok(self.repo.find_by_customer_id(customer_id).await?)
    }

    pub async fn find_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Vec<PaymentRecord>, PaymentStoreError> {
        Ok(self.repo.find_by_user_id(user_id).await?)
    }

    /// Most recently created record that is entitled and not set to lapse.
    pub async fn find_active_subscription_by_user_id(
        &self,
        user_id: Uuid,
    ) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        let records = self.repo.find_by_user_id(user_id).await?;
        let qualifying = records.iter().filter(|r| r.is_active_subscription()).count();
        if qualifying > 1 {
            warn!(%user_id, qualifying, "multiple active subscriptions, using newest");
        }
        Ok(records.into_iter().find(PaymentRecord::is_active_subscription))
    }

    pub async fn has_active_subscription(&self, user_id: Uuid) -> Result<bool, PaymentStoreError> {
        Ok(self
            .find_active_subscription_by_user_id(user_id)
            .await?
            .is_some())
    }

    pub async fn update(
        &self,
        id: Uuid,
        changes: &PaymentRecordUpdate,
    ) -> Result<Option<PaymentRecord>, PaymentStoreError> {
        Ok(self.repo.update(id, changes).await?)
    }

    pub async fn update_subscription_status(
        &self,
        subscription_id: &str,
        status: PaymentStatus,
        metadata: Option<&Value>,
    ) -> Result<PaymentRecord, PaymentStoreError> {
        let current = self
            .repo
            .find_by_subscription_id(subscription_id)
            .await?
            .ok_or_else(|| PaymentStoreError::NotFound(subscription_id.to_string()))?;

        if self.transition_decision(Some(subscription_id), current.status, status)
            == TransitionDecision::Quarantine
        {
            return Err(PaymentStoreError::Quarantined {
                from: current.status,
                to: status,
            });
        }

        let updated = self
            .repo
            .update_status_by_subscription_id(subscription_id, status, metadata)
            .await?
            .ok_or_else(|| PaymentStoreError::NotFound(subscription_id.to_string()))?;
        info!(subscription_id, from = %current.status, to = %status, "subscription status updated");
        Ok(updated)
    }

    pub async fn cancel_user_subscriptions(&self, user_id: Uuid) -> Result<u64, PaymentStoreError> {
        Ok(self.repo.cancel_user_subscriptions(user_id).await?)
    }

    /// Returns false when the provider event was already recorded.
    pub async fn create_event(
        &self,
        payment_id: Uuid,
        event_type: &str,
        provider_event_id: &str,
        event_data: Value,
    ) -> Result<bool, PaymentStoreError> {
        let event = NewPaymentEvent {
            payment_id,
            event_type: event_type.to_string(),
            provider_event_id: provider_event_id.to_string(),
            event_data,
        };
        Ok(self.repo.create_event(&event).await?)
    }

    pub async fn is_event_processed(
        &self,
        provider_event_id: &str,
    ) -> Result<bool, PaymentStoreError> {
        Ok(self.repo.is_event_processed(provider_event_id).await?)
    }

    pub async fn find_user_id_by_customer_id(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Option<Uuid>, PaymentStoreError> {
        Ok(self
            .repo
            .find_user_id_by_customer_id(provider, customer_id)
            .await?)
    }

    pub async fn link_customer(
        &self,
        provider: &str,
        customer_id: &str,
        user_id: Uuid,
    ) -> Result<(), PaymentStoreError> {
        Ok(self.repo.link_customer(provider, customer_id, user_id).await?)
    }

    pub async fn apply_webhook_effect(
        &self,
        effect: &WebhookEffect,
    ) -> Result<ApplyOutcome, PaymentStoreError> {
        Ok(self.repo.apply_webhook_effect(effect).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock_payment_repository::MockPaymentRepository;
    use crate::models::payment::{BillingInterval, PaymentType};
    use serde_json::json;

    fn store(policy: TransitionPolicy) -> (PaymentStore, MockPaymentRepository) {
        let repo = MockPaymentRepository::new();
        (PaymentStore::new(Arc::new(repo.clone()), policy), repo)
    }

    fn subscription(user_id: Uuid, sub: &str, status: PaymentStatus) -> NewPaymentRecord {
        NewPaymentRecord {
            provider: "stripe".into(),
            user_id,
            customer_id: format!("cus_{sub}"),
            subscription_id: Some(sub.to_string()),
            price_id: Some("price_pro_monthly".into()),
            product_id: None,
            plan_id: Some("pro".into()),
            payment_type: PaymentType::Subscription,
            interval: BillingInterval::Monthly,
            status,
            period_start: None,
            period_end: None,
            cancel_at_period_end: false,
            trial_start: None,
            trial_end: None,
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn active_subscription_excludes_cancel_at_period_end() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let user = Uuid::new_v4();
        let mut record = subscription(user, "sub_1", PaymentStatus::Active);
        record.cancel_at_period_end = true;
        store.create(&record).await.unwrap();

        assert!(store
            .find_active_subscription_by_user_id(user)
            .await
            .unwrap()
            .is_none());
        assert!(!store.has_active_subscription(user).await.unwrap());
    }

    #[tokio::test]
    async fn newest_qualifying_record_wins() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let user = Uuid::new_v4();
        store
            .create(&subscription(user, "sub_old", PaymentStatus::Active))
            .await
            .unwrap();
        store
            .create(&subscription(user, "sub_new", PaymentStatus::Trialing))
            .await
            .unwrap();
        let mut lapsing = subscription(user, "sub_lapsing", PaymentStatus::Active);
        lapsing.cancel_at_period_end = true;
        store.create(&lapsing).await.unwrap();
        store
            .create(&subscription(user, "sub_dead", PaymentStatus::Canceled))
            .await
            .unwrap();

        let active = store
            .find_active_subscription_by_user_id(user)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(active.subscription_id.as_deref(), Some("sub_new"));
    }

    #[tokio::test]
    async fn out_of_table_transition_is_applied_when_permissive() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let user = Uuid::new_v4();
        store
            .create(&subscription(user, "sub_1", PaymentStatus::Canceled))
            .await
            .unwrap();

        let updated = store
            .update_subscription_status("sub_1", PaymentStatus::Active, Some(&json!({"reason": "reactivated"})))
            .await
            .unwrap();
        assert_eq!(updated.status, PaymentStatus::Active);
        assert_eq!(updated.metadata["reason"], "reactivated");
    }

    #[tokio::test]
    async fn out_of_table_transition_is_quarantined_when_strict() {
        let (store, repo) = store(TransitionPolicy::Strict);
        let user = Uuid::new_v4();
        store
            .create(&subscription(user, "sub_1", PaymentStatus::Canceled))
            .await
            .unwrap();

        let result = store
            .update_subscription_status("sub_1", PaymentStatus::Active, None)
            .await;
        assert!(matches!(
            result,
            Err(PaymentStoreError::Quarantined {
                from: PaymentStatus::Canceled,
                to: PaymentStatus::Active
            })
        ));
        assert_eq!(repo.records()[0].status, PaymentStatus::Canceled);
    }

    #[test]
    fn same_state_and_table_transitions_apply() {
        let (store, _) = store(TransitionPolicy::Strict);
        assert_eq!(
            store.transition_decision(None, PaymentStatus::Canceled, PaymentStatus::Canceled),
            TransitionDecision::Apply
        );
        assert_eq!(
            store.transition_decision(None, PaymentStatus::Trialing, PaymentStatus::Active),
            TransitionDecision::Apply
        );
        assert_eq!(
            store.transition_decision(None, PaymentStatus::Unpaid, PaymentStatus::PastDue),
            TransitionDecision::Quarantine
        );
    }

    #[tokio::test]
    async fn unknown_subscription_is_not_found() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let result = store
            .update_subscription_status("sub_missing", PaymentStatus::Active, None)
            .await;
        assert!(matches!(result, Err(PaymentStoreError::NotFound(id)) if id == "sub_missing"));
    }

    #[tokio::test]
    async fn cancel_user_subscriptions_skips_terminal_rows() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let user = Uuid::new_v4();
        store
            .create(&subscription(user, "sub_1", PaymentStatus::Active))
            .await
            .unwrap();
        store
            .create(&subscription(user, "sub_2", PaymentStatus::PastDue))
            .await
            .unwrap();
        store
            .create(&subscription(user, "sub_3", PaymentStatus::Canceled))
            .await
            .unwrap();

        assert_eq!(store.cancel_user_subscriptions(user).await.unwrap(), 2);
        assert!(store
            .find_by_user_id(user)
            .await
            .unwrap()
            .iter()
            .all(|r| r.status == PaymentStatus::Canceled));
    }

    #[tokio::test]
    async fn events_are_recorded_once() {
        let (store, _) = store(TransitionPolicy::Permissive);
        let record = store
            .create(&subscription(Uuid::new_v4(), "sub_1", PaymentStatus::Active))
            .await
            .unwrap();

        assert!(!store.is_event_processed("evt_1").await.unwrap());
        assert!(store
            .create_event(record.id, "created", "evt_1", json!({}))
            .await
            .unwrap());
        assert!(!store
            .create_event(record.id, "created", "evt_1", json!({}))
            .await
            .unwrap());
        assert!(store.is_event_processed("evt_1").await.unwrap());
    }
}

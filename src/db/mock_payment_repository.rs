use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::mock_credit_repository::MockCreditRepository;
use crate::db::payment_repository::{ApplyOutcome, PaymentRepository, PaymentWrite, WebhookEffect};
use crate::models::payment::{
    NewPaymentEvent, NewPaymentRecord, PaymentEvent, PaymentRecord, PaymentRecordUpdate,
    PaymentStatus,
};

#[derive(Default)]
pub struct PaymentState {
    pub records: Vec<PaymentRecord>,
    pub events: Vec<PaymentEvent>,
    pub customers: HashMap<(String, String), Uuid>,
}

impl PaymentState {
    fn insert(&mut self, record: &NewPaymentRecord) -> PaymentRecord {
        // Keep created_at strictly increasing so "newest first" is deterministic.
        let mut now = OffsetDateTime::now_utc();
        if let Some(last) = self.records.iter().map(|r| r.created_at).max() {
            if now <= last {
                now = last + time::Duration::microseconds(1);
            }
        }
        let stored = record.clone().into_record(Uuid::new_v4(), now);
        self.records.push(stored.clone());
        stored
    }

    fn update(&mut self, id: Uuid, changes: &PaymentRecordUpdate) -> Option<PaymentRecord> {
        let record = self.records.iter_mut().find(|r| r.id == id)?;
        changes.apply_to(record, OffsetDateTime::now_utc());
        Some(record.clone())
    }

    fn record_event(&mut self, event: &NewPaymentEvent) -> bool {
        if self
            .events
            .iter()
            .any(|e| e.provider_event_id == event.provider_event_id)
        {
            return false;
        }
        self.events.push(PaymentEvent {
            id: Uuid::new_v4(),
            payment_id: event.payment_id,
            event_type: event.event_type.clone(),
            provider_event_id: event.provider_event_id.clone(),
            event_data: event.event_data.clone(),
            created_at: OffsetDateTime::now_utc(),
        });
        true
    }

    fn newest_by<F: Fn(&PaymentRecord) -> bool>(&self, predicate: F) -> Option<PaymentRecord> {
        self.records
            .iter()
            .filter(|r| predicate(r))
            .max_by_key(|r| r.created_at)
            .cloned()
    }
}

/// In-memory payment store. When built with a ledger, webhook effects apply
/// their credit grant under the same lock as the payment write.
#[derive(Clone, Default)]
pub struct MockPaymentRepository {
    pub state: Arc<Mutex<PaymentState>>,
    pub ledger: Option<MockCreditRepository>,
    pub should_fail: Arc<Mutex<bool>>,
    pub apply_calls: Arc<Mutex<usize>>,
}

impl MockPaymentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ledger(ledger: MockCreditRepository) -> Self {
        Self {
            ledger: Some(ledger),
            ..Self::default()
        }
    }

    pub fn fail_next_calls(&self, fail: bool) {
        *self.should_fail.lock().unwrap() = fail;
    }

    fn check_failure(&self) -> Result<(), sqlx::Error> {
        if *self.should_fail.lock().unwrap() {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(())
    }

    pub fn records(&self) -> Vec<PaymentRecord> {
        self.state.lock().unwrap().records.clone()
    }

    pub fn events(&self) -> Vec<PaymentEvent> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn seed(&self, record: PaymentRecord) {
        self.state.lock().unwrap().records.push(record);
    }
}

#[async_trait]
impl PaymentRepository for MockPaymentRepository {
    async fn create(&self, record: &NewPaymentRecord) -> Result<PaymentRecord, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().insert(record))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().newest_by(|r| r.id == id))
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .newest_by(|r| r.subscription_id.as_deref() == Some(subscription_id)))
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .newest_by(|r| r.customer_id == customer_id))
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        let mut records: Vec<PaymentRecord> = self
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &PaymentRecordUpdate,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().update(id, changes))
    }

    async fn update_status_by_subscription_id(
        &self,
        subscription_id: &str,
        status: PaymentStatus,
        metadata: Option<&Value>,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.newest_by(|r| r.subscription_id.as_deref() == Some(subscription_id))
        else {
            return Ok(None);
        };
        let mut merged = current.metadata.clone();
        if let (Some(target), Some(Value::Object(extra))) = (merged.as_object_mut(), metadata) {
            for (k, v) in extra {
                target.insert(k.clone(), v.clone());
            }
        }
        let changes = PaymentRecordUpdate {
            status: Some(status),
            metadata: Some(merged),
            ..Default::default()
        };
        Ok(state.update(current.id, &changes))
    }

    async fn cancel_user_subscriptions(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let mut count = 0;
        for record in state
            .records
            .iter_mut()
            .filter(|r| r.user_id == user_id && r.status != PaymentStatus::Canceled)
        {
            record.status = PaymentStatus::Canceled;
            record.cancel_at_period_end = true;
            record.updated_at = now;
            count += 1;
        }
        Ok(count)
    }

    async fn create_event(&self, event: &NewPaymentEvent) -> Result<bool, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().record_event(event))
    }

    async fn is_event_processed(&self, provider_event_id: &str) -> Result<bool, sqlx::Error> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .events
            .iter()
            .any(|e| e.provider_event_id == provider_event_id))
    }

    async fn find_user_id_by_customer_id(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        self.check_failure()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .customers
            .get(&(provider.to_string(), customer_id.to_string()))
            .copied())
    }

    async fn link_customer(
        &self,
        provider: &str,
        customer_id: &str,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        self.check_failure()?;
        self.state
            .lock()
            .unwrap()
            .customers
            .entry((provider.to_string(), customer_id.to_string()))
            .or_insert(user_id);
        Ok(())
    }

    async fn apply_webhook_effect(
        &self,
        effect: &WebhookEffect,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        self.check_failure()?;
        *self.apply_calls.lock().unwrap() += 1;

        let mut state = self.state.lock().unwrap();
        if state
            .events
            .iter()
            .any(|e| e.provider_event_id == effect.provider_event_id)
        {
            return Ok(ApplyOutcome::Duplicate);
        }

        let payment = match &effect.payment {
            PaymentWrite::Insert(record) => state.insert(record),
            PaymentWrite::Update {
                payment_id,
                changes,
            } => state
                .update(*payment_id, changes)
                .ok_or(sqlx::Error::RowNotFound)?,
            PaymentWrite::RecordOnly { payment_id } => state
                .newest_by(|r| r.id == *payment_id)
                .ok_or(sqlx::Error::RowNotFound)?,
        };

        state.record_event(&NewPaymentEvent {
            payment_id: payment.id,
            event_type: effect.lifecycle.as_str().to_string(),
            provider_event_id: effect.provider_event_id.clone(),
            event_data: effect.event_data.clone(),
        });

        let credit_grant = match (&effect.credit_grant, &self.ledger) {
            (Some(mutation), Some(ledger)) => Some(ledger.state.lock().unwrap().grant(mutation)),
            _ => None,
        };

        Ok(ApplyOutcome::Applied {
            payment,
            credit_grant,
        })
    }
}

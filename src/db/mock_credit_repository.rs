use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::credit_repository::CreditRepository;
use crate::models::credit::{
    CreditAccount, CreditMutation, CreditSource, CreditTransaction, CreditTransactionType,
    FreezeOutcome, GrantOutcome, SpendOutcome, UnfreezeOutcome,
};

#[derive(Default)]
pub struct LedgerState {
    pub accounts: HashMap<Uuid, CreditAccount>,
    pub transactions: Vec<CreditTransaction>,
}

impl LedgerState {
    fn find_by_reference(&self, user_id: Uuid, reference_id: &str) -> Option<CreditTransaction> {
        self.transactions
            .iter()
            .find(|t| t.user_id == user_id && t.reference_id.as_deref() == Some(reference_id))
            .cloned()
    }

    #[allow(clippy::too_many_arguments)]
    fn push_transaction(
        &mut self,
        user_id: Uuid,
        transaction_type: CreditTransactionType,
        amount: i64,
        balance_after: i64,
        source: CreditSource,
        description: &str,
        reference_id: Option<String>,
        metadata: serde_json::Value,
    ) -> CreditTransaction {
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id,
            transaction_type,
            amount,
            balance_after,
            source,
            description: description.to_string(),
            reference_id,
            metadata,
            created_at: OffsetDateTime::now_utc(),
        };
        self.transactions.push(tx.clone());
        tx
    }

    pub fn grant(&mut self, mutation: &CreditMutation) -> GrantOutcome {
        if let Some(reference_id) = mutation.reference_id.as_deref() {
            if let Some(existing) = self.find_by_reference(mutation.user_id, reference_id) {
                return GrantOutcome::AlreadyGranted {
                    transaction: existing,
                };
            }
        }
        let now = OffsetDateTime::now_utc();
        let account = self
            .accounts
            .entry(mutation.user_id)
            .or_insert_with(|| CreditAccount::empty(mutation.user_id, now));
        account.balance += mutation.amount;
        account.total_earned += mutation.amount;
        account.updated_at = now;
        let account = account.clone();
        let transaction = self.push_transaction(
            mutation.user_id,
            CreditTransactionType::Earn,
            mutation.amount,
            account.balance,
            mutation.source,
            &mutation.description,
            mutation.reference_id.clone(),
            mutation.metadata.clone(),
        );
        GrantOutcome::Granted {
            account,
            transaction,
        }
    }
}

/// In-memory ledger; one mutex stands in for the per-user row lock.
#[derive(Clone, Default)]
pub struct MockCreditRepository {
    pub state: Arc<Mutex<LedgerState>>,
    pub should_fail: Arc<Mutex<bool>>,
}

impl MockCreditRepository {
    pub fn new() -> Self {
        Self::default()
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

    pub fn transactions_for(&self, user_id: Uuid) -> Vec<CreditTransaction> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CreditRepository for MockCreditRepository {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<CreditAccount>, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().accounts.get(&user_id).cloned())
    }

    async fn grant(&self, mutation: &CreditMutation) -> Result<GrantOutcome, sqlx::Error> {
        self.check_failure()?;
        Ok(self.state.lock().unwrap().grant(mutation))
    }

    async fn spend(&self, mutation: &CreditMutation) -> Result<SpendOutcome, sqlx::Error> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let Some(current) = state.accounts.get(&mutation.user_id).cloned() else {
            return Ok(SpendOutcome::NotFound);
        };
        if let Some(reference_id) = mutation.reference_id.as_deref() {
            if let Some(existing) = state.find_by_reference(mutation.user_id, reference_id) {
                return Ok(SpendOutcome::AlreadySpent {
                    transaction: existing,
                });
            }
        }
        if current.balance < mutation.amount {
            return Ok(SpendOutcome::InsufficientBalance {
                balance: current.balance,
                required: mutation.amount,
            });
        }
        let account = {
            let account = state
                .accounts
                .get_mut(&mutation.user_id)
                .expect("account checked above");
            account.balance -= mutation.amount;
            account.total_spent += mutation.amount;
            account.updated_at = OffsetDateTime::now_utc();
            account.clone()
        };
        let transaction = state.push_transaction(
            mutation.user_id,
            CreditTransactionType::Spend,
            mutation.amount,
            account.balance,
            mutation.source,
            &mutation.description,
            mutation.reference_id.clone(),
            mutation.metadata.clone(),
        );
        Ok(SpendOutcome::Spent {
            account,
            transaction,
        })
    }

    async fn freeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<FreezeOutcome, sqlx::Error> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let balance = state.accounts.get(&user_id).map(|a| a.balance).unwrap_or(0);
        if balance < amount {
            return Ok(FreezeOutcome::InsufficientBalance {
                balance,
                required: amount,
            });
        }
        let account = {
            let account = state.accounts.get_mut(&user_id).expect("balance checked above");
            account.balance -= amount;
            account.frozen_balance += amount;
            account.updated_at = OffsetDateTime::now_utc();
            account.clone()
        };
        let transaction = state.push_transaction(
            user_id,
            CreditTransactionType::Freeze,
            amount,
            account.balance,
            CreditSource::DisputeHold,
            reason,
            None,
            json!({ "reason": reason }),
        );
        Ok(FreezeOutcome::Frozen {
            account,
            transaction,
        })
    }

    async fn unfreeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<UnfreezeOutcome, sqlx::Error> {
        self.check_failure()?;
        let mut state = self.state.lock().unwrap();
        let frozen_balance = state
            .accounts
            .get(&user_id)
            .map(|a| a.frozen_balance)
            .unwrap_or(0);
        if frozen_balance < amount {
            return Ok(UnfreezeOutcome::InsufficientFrozenBalance {
                frozen_balance,
                required: amount,
            });
        }
        let account = {
            let account = state
                .accounts
                .get_mut(&user_id)
                .expect("frozen balance checked above");
            account.balance += amount;
            account.frozen_balance -= amount;
            account.updated_at = OffsetDateTime::now_utc();
            account.clone()
        };
        let transaction = state.push_transaction(
            user_id,
            CreditTransactionType::Unfreeze,
            amount,
            account.balance,
            CreditSource::DisputeHold,
            reason,
            None,
            json!({ "reason": reason }),
        );
        Ok(UnfreezeOutcome::Unfrozen {
            account,
            transaction,
        })
    }

    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error> {
        self.check_failure()?;
        Ok(self
            .transactions_for(user_id)
            .into_iter()
            .rev()
            .take(limit.max(0) as usize)
            .collect())
    }
}

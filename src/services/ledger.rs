use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::credit_repository::CreditRepository;
use crate::models::credit::{
    CreditAccount, CreditMutation, CreditTransaction, FreezeOutcome, GrantOutcome, SpendOutcome,
    UnfreezeOutcome,
};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("credit amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn ensure_positive(amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

/// Sole entry point for balance changes. Business outcomes (duplicate
/// reference, insufficient funds) come back as outcome values; only invalid
/// input and storage faults are errors.
#[derive(Clone)]
pub struct CreditLedger {
    repo: Arc<dyn CreditRepository>,
}

impl CreditLedger {
    pub fn new(repo: Arc<dyn CreditRepository>) -> Self {
        Self { repo }
    }

    /// `None` means the user has never been granted credits: balance 0.
    pub async fn get_balance(&self, user_id: Uuid) -> Result<Option<CreditAccount>, LedgerError> {
        Ok(self.repo.find_account(user_id).await?)
    }

    pub async fn grant(&self, mutation: CreditMutation) -> Result<GrantOutcome, LedgerError> {
        ensure_positive(mutation.amount)?;
        let outcome = self.repo.grant(&mutation).await.map_err(|err| {
            error!(user_id = %mutation.user_id, ?err, "credit grant failed");
            err
        })?;

        match &outcome {
            GrantOutcome::Granted { account, .. } => info!(
                user_id = %mutation.user_id,
                amount = mutation.amount,
                source = %mutation.source,
                reference_id = mutation.reference_id.as_deref(),
                balance = account.balance,
                "credits granted"
            ),
            GrantOutcome::AlreadyGranted { transaction } => info!(
                user_id = %mutation.user_id,
                reference_id = transaction.reference_id.as_deref(),
                "credit grant already applied, skipping"
            ),
        }
        Ok(outcome)
    }

    pub async fn spend(&self, mutation: CreditMutation) -> Result<SpendOutcome, LedgerError> {
        ensure_positive(mutation.amount)?;
        let outcome = self.repo.spend(&mutation).await.map_err(|err| {
            error!(user_id = %mutation.user_id, ?err, "credit spend failed");
            err
        })?;

        match &outcome {
            SpendOutcome::Spent { account, .. } => info!(
                user_id = %mutation.user_id,
                amount = mutation.amount,
                source = %mutation.source,
                reference_id = mutation.reference_id.as_deref(),
                balance = account.balance,
                "credits spent"
            ),
            SpendOutcome::AlreadySpent { .. } => info!(
                user_id = %mutation.user_id,
                reference_id = mutation.reference_id.as_deref(),
                "spend already recorded for reference"
            ),
            SpendOutcome::InsufficientBalance { balance, required } => warn!(
                user_id = %mutation.user_id,
                balance,
                required,
                "insufficient credits"
            ),
            SpendOutcome::NotFound => warn!(user_id = %mutation.user_id, "no credit account"),
        }
        Ok(outcome)
    }

    pub async fn freeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<FreezeOutcome, LedgerError> {
        ensure_positive(amount)?;
        let outcome = self.repo.freeze(user_id, amount, reason).await?;
        if let FreezeOutcome::Frozen { account, .. } = &outcome {
            info!(%user_id, amount, reason, frozen = account.frozen_balance, "credits frozen");
        }
        Ok(outcome)
    }

    pub async fn unfreeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<UnfreezeOutcome, LedgerError> {
        ensure_positive(amount)?;
        let outcome = self.repo.unfreeze(user_id, amount, reason).await?;
        if let UnfreezeOutcome::Unfrozen { account, .. } = &outcome {
            info!(%user_id, amount, reason, balance = account.balance, "credits unfrozen");
        }
        Ok(outcome)
    }

    /// Newest first.
    pub async fn get_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, LedgerError> {
        Ok(self.repo.list_transactions(user_id, limit).await?)
    }
}

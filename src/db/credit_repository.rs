use async_trait::async_trait;
use uuid::Uuid;

use crate::models::credit::{
    CreditAccount, CreditMutation, CreditTransaction, FreezeOutcome, GrantOutcome, SpendOutcome,
    UnfreezeOutcome,
};

/// Every mutating call is one atomic unit: the balance change and its
/// transaction row commit together or not at all, serialized per user.
#[async_trait]
pub trait CreditRepository: Send + Sync {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<CreditAccount>, sqlx::Error>;

    async fn grant(&self, mutation: &CreditMutation) -> Result<GrantOutcome, sqlx::Error>;

    async fn spend(&self, mutation: &CreditMutation) -> Result<SpendOutcome, sqlx::Error>;

    async fn freeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<FreezeOutcome, sqlx::Error>;

    async fn unfreeze(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> Result<UnfreezeOutcome, sqlx::Error>;

    /// Newest first, at most `limit` rows.
    async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> Result<Vec<CreditTransaction>, sqlx::Error>;
}

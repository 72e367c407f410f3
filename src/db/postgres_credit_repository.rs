use async_trait::async_trait;
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::db::credit_repository::CreditRepository;
use crate::models::credit::{
    CreditAccount, CreditMutation, CreditSource, CreditTransaction, CreditTransactionType,
    FreezeOutcome, GrantOutcome, SpendOutcome, UnfreezeOutcome,
};

const ACCOUNT_COLUMNS: &str =
    "user_id, balance, total_earned, total_spent, frozen_balance, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, balance_after, source, description, reference_id, metadata, created_at";

pub struct PostgresCreditRepository {
    pub pool: PgPool,
}

async fn lock_account(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<Option<CreditAccount>, sqlx::Error> {
    sqlx::query_as::<_, CreditAccount>(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1 FOR UPDATE"
    ))
    .bind(user_id)
    .fetch_optional(conn)
    .await
}

async fn find_by_reference(
    conn: &mut PgConnection,
    user_id: Uuid,
    reference_id: &str,
) -> Result<Option<CreditTransaction>, sqlx::Error> {
    sqlx::query_as::<_, CreditTransaction>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE user_id = $1 AND reference_id = $2"
    ))
    .bind(user_id)
    .bind(reference_id)
    .fetch_optional(conn)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn insert_transaction(
    conn: &mut PgConnection,
    user_id: Uuid,
    transaction_type: CreditTransactionType,
    amount: i64,
    balance_after: i64,
    source: CreditSource,
    description: &str,
    reference_id: Option<&str>,
    metadata: &serde_json::Value,
) -> Result<CreditTransaction, sqlx::Error> {
    sqlx::query_as::<_, CreditTransaction>(&format!(
        r#"
        INSERT INTO credit_transactions
            (id, user_id, type, amount, balance_after, source, description, reference_id, metadata)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING {TRANSACTION_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(transaction_type)
    .bind(amount)
    .bind(balance_after)
    .bind(source)
    .bind(description)
    .bind(reference_id)
    .bind(metadata)
    .fetch_one(conn)
    .await
}

/// Grant inside an already-open transaction. Shared with the webhook apply
/// path so a payment event and its credit grant commit together.
pub(crate) async fn grant_in_tx(
    conn: &mut PgConnection,
    mutation: &CreditMutation,
) -> Result<GrantOutcome, sqlx::Error> {
    sqlx::query("INSERT INTO credit_accounts (user_id) VALUES ($1) ON CONFLICT (user_id) DO NOTHING")
        .bind(mutation.user_id)
        .execute(&mut *conn)
        .await?;

    // Row lock serializes concurrent grants/spends for this user.
    lock_account(&mut *conn, mutation.user_id).await?;

    if let Some(reference_id) = mutation.reference_id.as_deref() {
        if let Some(existing) = find_by_reference(&mut *conn, mutation.user_id, reference_id).await? {
            debug!(user_id = %mutation.user_id, reference_id, "grant already applied");
            return Ok(GrantOutcome::AlreadyGranted {
                transaction: existing,
            });
        }
    }

    let account = sqlx::query_as::<_, CreditAccount>(&format!(
        r#"
        UPDATE credit_accounts
        SET balance = balance + $2,
            total_earned = total_earned + $2,
            updated_at = now()
        WHERE user_id = $1
        RETURNING {ACCOUNT_COLUMNS}
        "#
    ))
    .bind(mutation.user_id)
    .bind(mutation.amount)
    .fetch_one(&mut *conn)
    .await?;

    let transaction = insert_transaction(
        conn,
        mutation.user_id,
        CreditTransactionType::Earn,
        mutation.amount,
        account.balance,
        mutation.source,
        &mutation.description,
        mutation.reference_id.as_deref(),
        &mutation.metadata,
    )
    .await?;

    Ok(GrantOutcome::Granted {
        account,
        transaction,
    })
}

#[async_trait]
impl CreditRepository for PostgresCreditRepository {
    async fn find_account(&self, user_id: Uuid) -> Result<Option<CreditAccount>, sqlx::Error> {
        sqlx::query_as::<_, CreditAccount>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn grant(&self, mutation: &CreditMutation) -> Result<GrantOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let outcome = grant_in_tx(&mut tx, mutation).await?;
        match outcome {
            GrantOutcome::Granted { .. } => tx.commit().await?,
            GrantOutcome::AlreadyGranted { .. } => tx.rollback().await?,
        }
        Ok(outcome)
    }

    async fn spend(&self, mutation: &CreditMutation) -> Result<SpendOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let Some(account) = lock_account(&mut tx, mutation.user_id).await? else {
            tx.rollback().await?;
            return Ok(SpendOutcome::NotFound);
        };

        if let Some(reference_id) = mutation.reference_id.as_deref() {
            if let Some(existing) = find_by_reference(&mut tx, mutation.user_id, reference_id).await? {
                tx.rollback().await?;
                return Ok(SpendOutcome::AlreadySpent {
                    transaction: existing,
                });
            }
        }

        if account.balance < mutation.amount {
            tx.rollback().await?;
            return Ok(SpendOutcome::InsufficientBalance {
                balance: account.balance,
                required: mutation.amount,
            });
        }

        let account = sqlx::query_as::<_, CreditAccount>(&format!(
            r#"
            UPDATE credit_accounts
            SET balance = balance - $2,
                total_spent = total_spent + $2,
                updated_at = now()
            WHERE user_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(mutation.user_id)
        .bind(mutation.amount)
        .fetch_one(&mut *tx)
        .await?;

        let transaction = insert_transaction(
            &mut tx,
            mutation.user_id,
            CreditTransactionType::Spend,
            mutation.amount,
            account.balance,
            mutation.source,
            &mutation.description,
            mutation.reference_id.as_deref(),
            &mutation.metadata,
        )
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let balance = lock_account(&mut tx, user_id)
            .await?
            .map(|a| a.balance)
            .unwrap_or(0);
        if balance < amount {
            tx.rollback().await?;
            return Ok(FreezeOutcome::InsufficientBalance {
                balance,
                required: amount,
            });
        }

        let account = sqlx::query_as::<_, CreditAccount>(&format!(
            r#"
            UPDATE credit_accounts
            SET balance = balance - $2,
                frozen_balance = frozen_balance + $2,
                updated_at = now()
            WHERE user_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        let transaction = insert_transaction(
            &mut tx,
            user_id,
            CreditTransactionType::Freeze,
            amount,
            account.balance,
            CreditSource::DisputeHold,
            reason,
            None,
            &json!({ "reason": reason }),
        )
        .await?;

        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;

        let frozen_balance = lock_account(&mut tx, user_id)
            .await?
            .map(|a| a.frozen_balance)
            .unwrap_or(0);
        if frozen_balance < amount {
            tx.rollback().await?;
            return Ok(UnfreezeOutcome::InsufficientFrozenBalance {
                frozen_balance,
                required: amount,
            });
        }

        let account = sqlx::query_as::<_, CreditAccount>(&format!(
            r#"
            UPDATE credit_accounts
            SET balance = balance + $2,
                frozen_balance = frozen_balance - $2,
                updated_at = now()
            WHERE user_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(amount)
        .fetch_one(&mut *tx)
        .await?;

        let transaction = insert_transaction(
            &mut tx,
            user_id,
            CreditTransactionType::Unfreeze,
            amount,
            account.balance,
            CreditSource::DisputeHold,
            reason,
            None,
            &json!({ "reason": reason }),
        )
        .await?;

        tx.commit().await?;
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
        sqlx::query_as::<_, CreditTransaction>(&format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }
}

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::payment_repository::{ApplyOutcome, PaymentRepository, PaymentWrite, WebhookEffect};
use crate::db::postgres_credit_repository::grant_in_tx;
use crate::models::payment::{
    NewPaymentEvent, NewPaymentRecord, PaymentRecord, PaymentRecordUpdate, PaymentStatus,
};

const PAYMENT_COLUMNS: &str = r#"
    id, provider, user_id, customer_id, subscription_id, price_id, product_id, plan_id,
    previous_plan_id, payment_type, interval, status, period_start, period_end,
    cancel_at_period_end, trial_start, trial_end, metadata, created_at, updated_at
"#;

pub struct PostgresPaymentRepository {
    pub pool: PgPool,
}

async fn insert_payment(
    conn: &mut PgConnection,
    record: &NewPaymentRecord,
) -> Result<PaymentRecord, sqlx::Error> {
    sqlx::query_as::<_, PaymentRecord>(&format!(
        r#"
        INSERT INTO payment (
            id, provider, user_id, customer_id, subscription_id, price_id, product_id,
            plan_id, payment_type, interval, status, period_start, period_end,
            cancel_at_period_end, trial_start, trial_end, metadata
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        RETURNING {PAYMENT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(&record.provider)
    .bind(record.user_id)
    .bind(&record.customer_id)
    .bind(&record.subscription_id)
    .bind(&record.price_id)
    .bind(&record.product_id)
    .bind(&record.plan_id)
    .bind(record.payment_type)
    .bind(record.interval)
    .bind(record.status)
    .bind(record.period_start)
    .bind(record.period_end)
    .bind(record.cancel_at_period_end)
    .bind(record.trial_start)
    .bind(record.trial_end)
    .bind(&record.metadata)
    .fetch_one(conn)
    .await
}

async fn update_payment(
    conn: &mut PgConnection,
    id: Uuid,
    changes: &PaymentRecordUpdate,
) -> Result<Option<PaymentRecord>, sqlx::Error> {
    sqlx::query_as::<_, PaymentRecord>(&format!(
        r#"
        UPDATE payment
        SET subscription_id = COALESCE($2, subscription_id),
            price_id = COALESCE($3, price_id),
            product_id = COALESCE($4, product_id),
            plan_id = COALESCE($5, plan_id),
            previous_plan_id = COALESCE($6, previous_plan_id),
            interval = COALESCE($7, interval),
            status = COALESCE($8, status),
            period_start = COALESCE($9, period_start),
            period_end = COALESCE($10, period_end),
            cancel_at_period_end = COALESCE($11, cancel_at_period_end),
            trial_start = COALESCE($12, trial_start),
            trial_end = COALESCE($13, trial_end),
            metadata = COALESCE($14, metadata),
            updated_at = now()
        WHERE id = $1
        RETURNING {PAYMENT_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(&changes.subscription_id)
    .bind(&changes.price_id)
    .bind(&changes.product_id)
    .bind(&changes.plan_id)
    .bind(&changes.previous_plan_id)
    .bind(changes.interval)
    .bind(changes.status)
    .bind(changes.period_start)
    .bind(changes.period_end)
    .bind(changes.cancel_at_period_end)
    .bind(changes.trial_start)
    .bind(changes.trial_end)
    .bind(&changes.metadata)
    .fetch_optional(conn)
    .await
}

async fn insert_event(
    conn: &mut PgConnection,
    event: &NewPaymentEvent,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO payment_event (id, payment_id, event_type, provider_event_id, event_data)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (provider_event_id) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(event.payment_id)
    .bind(&event.event_type)
    .bind(&event.provider_event_id)
    .bind(&event.event_data)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl PaymentRepository for PostgresPaymentRepository {
    async fn create(&self, record: &NewPaymentRecord) -> Result<PaymentRecord, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        insert_payment(&mut conn, record).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<PaymentRecord>, sqlx::Error> {
        sqlx::query_as::<_, PaymentRecord>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payment
            WHERE subscription_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_customer_id(
        &self,
        customer_id: &str,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payment
            WHERE customer_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Vec<PaymentRecord>, sqlx::Error> {
        sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS} FROM payment
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn update(
        &self,
        id: Uuid,
        changes: &PaymentRecordUpdate,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        update_payment(&mut conn, id, changes).await
    }

    async fn update_status_by_subscription_id(
        &self,
        subscription_id: &str,
        status: PaymentStatus,
        metadata: Option<&Value>,
    ) -> Result<Option<PaymentRecord>, sqlx::Error> {
        sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            UPDATE payment
            SET status = $2,
                metadata = metadata || COALESCE($3, '{{}}'::jsonb),
                updated_at = now()
            WHERE id = (
                SELECT id FROM payment
                WHERE subscription_id = $1
                ORDER BY created_at DESC
                LIMIT 1
            )
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(subscription_id)
        .bind(status)
        .bind(metadata)
        .fetch_optional(&self.pool)
        .await
    }

    async fn cancel_user_subscriptions(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE payment
            SET status = $2, cancel_at_period_end = true, updated_at = now()
            WHERE user_id = $1 AND status <> $2
            "#,
        )
        .bind(user_id)
        .bind(PaymentStatus::Canceled)
        .execute(&self.pool)
        .await?;

        info!(%user_id, cancelled = result.rows_affected(), "cancelled user subscriptions");
        Ok(result.rows_affected())
    }

    async fn create_event(&self, event: &NewPaymentEvent) -> Result<bool, sqlx::Error> {
        let mut conn = self.pool.acquire().await?;
        insert_event(&mut conn, event).await
    }

    async fn is_event_processed(&self, provider_event_id: &str) -> Result<bool, sqlx::Error> {
        let exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM payment_event WHERE provider_event_id = $1",
        )
        .bind(provider_event_id)
        .fetch_optional(&self.pool)
        .await?
        .is_some();

        Ok(exists)
    }

    async fn find_user_id_by_customer_id(
        &self,
        provider: &str,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT user_id FROM payment_customer WHERE provider = $1 AND customer_id = $2",
        )
        .bind(provider)
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn link_customer(
        &self,
        provider: &str,
        customer_id: &str,
        user_id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO payment_customer (provider, customer_id, user_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (provider, customer_id) DO NOTHING
            "#,
        )
        .bind(provider)
        .bind(customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_webhook_effect(
        &self,
        effect: &WebhookEffect,
    ) -> Result<ApplyOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let payment = match &effect.payment {
            PaymentWrite::Insert(record) => insert_payment(&mut tx, record).await?,
            PaymentWrite::Update {
                payment_id,
                changes,
            } => update_payment(&mut tx, *payment_id, changes)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?,
            PaymentWrite::RecordOnly { payment_id } => sqlx::query_as::<_, PaymentRecord>(
                &format!("SELECT {PAYMENT_COLUMNS} FROM payment WHERE id = $1 FOR UPDATE"),
            )
            .bind(payment_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(sqlx::Error::RowNotFound)?,
        };

        // The unique index on provider_event_id arbitrates concurrent deliveries.
        let recorded = insert_event(
            &mut tx,
            &NewPaymentEvent {
                payment_id: payment.id,
                event_type: effect.lifecycle.as_str().to_string(),
                provider_event_id: effect.provider_event_id.clone(),
                event_data: effect.event_data.clone(),
            },
        )
        .await?;
        if !recorded {
            tx.rollback().await?;
            debug!(event_id = %effect.provider_event_id, "payment event already recorded");
            return Ok(ApplyOutcome::Duplicate);
        }

        let credit_grant = match &effect.credit_grant {
            Some(mutation) => Some(grant_in_tx(&mut tx, mutation).await?),
            None => None,
        };

        tx.commit().await?;
        Ok(ApplyOutcome::Applied {
            payment,
            credit_grant,
        })
    }
}

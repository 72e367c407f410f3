use async_trait::async_trait;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use crate::models::payment::PaymentStatus;

/// Downstream consumers of subscription changes (usage limits, session
/// claims). Called after the payment side has committed; failures are the
/// caller's to log.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriptionNotifier: Send + Sync {
    async fn subscription_changed(
        &self,
        user_id: Uuid,
        plan: &str,
        status: PaymentStatus,
    ) -> Result<(), sqlx::Error>;
}

/// Keeps the `user_usage` snapshot in step with the latest webhook.
pub struct UsageTrackingNotifier {
    pub pool: PgPool,
}

#[async_trait]
impl SubscriptionNotifier for UsageTrackingNotifier {
    async fn subscription_changed(
        &self,
        user_id: Uuid,
        plan: &str,
        status: PaymentStatus,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO user_usage (user_id, plan, subscription_status)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET plan = EXCLUDED.plan,
                subscription_status = EXCLUDED.subscription_status,
                updated_at = now()
            "#,
        )
        .bind(user_id)
        .bind(plan)
        .bind(status)
        .execute(&self.pool)
        .await?;

        debug!(%user_id, plan, %status, "usage tracking updated");
        Ok(())
    }
}

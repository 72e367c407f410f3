use async_trait::async_trait;
use serde_json::Value;
use time::Duration;
use uuid::Uuid;

use crate::models::session::{AuthUser, LegacySession, LegacyUser, PrimarySession};

/// The in-house auth system: users keyed by uuid, sessions keyed by an opaque
/// cookie token.
#[async_trait]
pub trait PrimaryAuthRepository: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<AuthUser>, sqlx::Error>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<AuthUser>, sqlx::Error>;

    async fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        email_verified: bool,
    ) -> Result<AuthUser, sqlx::Error>;

    async fn create_session(
        &self,
        user_id: Uuid,
        data: Value,
        ttl: Duration,
    ) -> Result<PrimarySession, sqlx::Error>;

    /// Expired sessions are purged and reported as missing.
    async fn find_session(&self, token: &str) -> Result<Option<PrimarySession>, sqlx::Error>;

    async fn delete_session(&self, token: &str) -> Result<bool, sqlx::Error>;

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, sqlx::Error>;
}

/// Read/write access to the legacy provider's user and session tables.
#[async_trait]
pub trait LegacyAuthRepository: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<LegacyUser>, sqlx::Error>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LegacyUser>, sqlx::Error>;

    async fn find_session(&self, token: &str) -> Result<Option<LegacySession>, sqlx::Error>;

    async fn create_session(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<LegacySession, sqlx::Error>;

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64, sqlx::Error>;
}

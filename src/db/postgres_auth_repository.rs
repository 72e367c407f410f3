use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::auth_repository::{LegacyAuthRepository, PrimaryAuthRepository};
use crate::models::session::{AuthUser, LegacySession, LegacyUser, PrimarySession};
use crate::utils::token::generate_session_token;

const USER_COLUMNS: &str = "id, email, name, email_verified, created_at";
const SESSION_COLUMNS: &str = "id, token, user_id, data, expires_at, created_at";

/// Upper bound on how long a cached session is trusted without re-reading
/// Postgres. Deletions made by another instance take effect here within it.
const CACHE_MAX_AGE: Duration = Duration::seconds(30);

struct CachedSession {
    session: PrimarySession,
    cached_at: OffsetDateTime,
}

/// Sessions are cached per instance by token. The cache only ever holds rows
/// that were read from or written to Postgres by this process, and each entry
/// is served for at most `CACHE_MAX_AGE`.
pub struct PostgresPrimaryAuthRepository {
    pub pool: PgPool,
    cache: DashMap<String, CachedSession>,
}

impl PostgresPrimaryAuthRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            cache: DashMap::new(),
        }
    }

    fn remember(&self, session: &PrimarySession, now: OffsetDateTime) {
        self.cache.insert(
            session.token.clone(),
            CachedSession {
                session: session.clone(),
                cached_at: now,
            },
        );
    }

    fn cached(&self, token: &str, now: OffsetDateTime) -> Option<PrimarySession> {
        let entry = self.cache.get(token)?;
        if !entry.session.is_expired(now) && now - entry.cached_at <= CACHE_MAX_AGE {
            debug!(session_id = %entry.session.id, "session cache hit");
            return Some(entry.session.clone());
        }
        drop(entry);
        debug!("cached session expired or stale, evicting");
        self.cache.remove(token);
        None
    }
}

#[async_trait]
impl PrimaryAuthRepository for PostgresPrimaryAuthRepository {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<AuthUser>, sqlx::Error> {
        sqlx::query_as::<_, AuthUser>(&format!(
            "SELECT {USER_COLUMNS} FROM auth_users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<AuthUser>, sqlx::Error> {
        sqlx::query_as::<_, AuthUser>(&format!(
            "SELECT {USER_COLUMNS} FROM auth_users WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        email_verified: bool,
    ) -> Result<AuthUser, sqlx::Error> {
        sqlx::query_as::<_, AuthUser>(&format!(
            r#"
            INSERT INTO auth_users (id, email, name, email_verified)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(name)
        .bind(email_verified)
        .fetch_one(&self.pool)
        .await
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        data: Value,
        ttl: Duration,
    ) -> Result<PrimarySession, sqlx::Error> {
        let expires_at = OffsetDateTime::now_utc() + ttl;
        let session = sqlx::query_as::<_, PrimarySession>(&format!(
            r#"
            INSERT INTO auth_sessions (id, token, user_id, data, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SESSION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(generate_session_token())
        .bind(user_id)
        .bind(&data)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|error| {
            error!(%user_id, ?error, "failed to persist session");
            error
        })?;

        self.remember(&session, OffsetDateTime::now_utc());
        info!(session_id = %session.id, %user_id, "persisted session and cached value");
        Ok(session)
    }

    async fn find_session(&self, token: &str) -> Result<Option<PrimarySession>, sqlx::Error> {
        let now = OffsetDateTime::now_utc();
        if let Some(session) = self.cached(token, now) {
            return Ok(Some(session));
        }

        let Some(session) = sqlx::query_as::<_, PrimarySession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM auth_sessions WHERE token = $1"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        if session.is_expired(now) {
            warn!(session_id = %session.id, "session expired in storage, removing");
            if let Err(error) = self.delete_session(token).await {
                error!(session_id = %session.id, ?error, "failed to purge expired session");
            }
            return Ok(None);
        }

        self.remember(&session, now);
        debug!(session_id = %session.id, "session cache refreshed from Postgres");
        Ok(Some(session))
    }

    async fn delete_session(&self, token: &str) -> Result<bool, sqlx::Error> {
        let removed = self.cache.remove(token).is_some();
        let result = sqlx::query("DELETE FROM auth_sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() > 0;
        if !deleted && removed {
            warn!("session missing from Postgres but removed from cache");
        }
        Ok(deleted)
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        self.cache.retain(|_, entry| entry.session.user_id != user_id);
        let result = sqlx::query("DELETE FROM auth_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        info!(%user_id, deleted = result.rows_affected(), "deleted primary sessions");
        Ok(result.rows_affected())
    }
}

pub struct PostgresLegacyAuthRepository {
    pub pool: PgPool,
}

#[async_trait]
impl LegacyAuthRepository for PostgresLegacyAuthRepository {
    async fn find_user(&self, user_id: &str) -> Result<Option<LegacyUser>, sqlx::Error> {
        sqlx::query_as::<_, LegacyUser>("SELECT id, email, name FROM legacy_users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LegacyUser>, sqlx::Error> {
        sqlx::query_as::<_, LegacyUser>(
            "SELECT id, email, name FROM legacy_users WHERE lower(email) = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_session(&self, token: &str) -> Result<Option<LegacySession>, sqlx::Error> {
        sqlx::query_as::<_, LegacySession>(
            "SELECT session_token, user_id, expires FROM legacy_sessions WHERE session_token = $1",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_session(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<LegacySession, sqlx::Error> {
        sqlx::query_as::<_, LegacySession>(
            r#"
            INSERT INTO legacy_sessions (session_token, user_id, expires)
            VALUES ($1, $2, $3)
            RETURNING session_token, user_id, expires
            "#,
        )
        .bind(generate_session_token())
        .bind(user_id)
        .bind(OffsetDateTime::now_utc() + ttl)
        .fetch_one(&self.pool)
        .await
    }

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM legacy_sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        info!(legacy_user_id = user_id, deleted = result.rows_affected(), "deleted legacy sessions");
        Ok(result.rows_affected())
    }
}

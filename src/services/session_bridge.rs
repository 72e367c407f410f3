//! One logical session over the primary auth store and the legacy provider
//! while both are live. The primary store is authoritative; the legacy store
//! is only consulted when a token is unknown to it.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::auth_repository::{LegacyAuthRepository, PrimaryAuthRepository};
use crate::db::user_mapping_repository::{MappingInsert, UserMappingRepository};
use crate::models::session::{
    LegacySession, LegacyUser, PrimarySession, SessionSource, SessionState, UnifiedSession,
    UserMapping,
};

#[derive(Debug, thiserror::Error)]
pub enum AuthStoreError {
    #[error("primary auth store: {0}")]
    Primary(#[source] sqlx::Error),
    #[error("legacy auth store: {0}")]
    Legacy(#[source] sqlx::Error),
    #[error("user mapping store: {0}")]
    Mapping(#[source] sqlx::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionBridgeError {
    #[error("session not found")]
    SessionNotFound,
    #[error("session expired")]
    SessionExpired,
    #[error("legacy user {0} not found")]
    LegacyUserNotFound(String),
    #[error("user {0} has no legacy identity")]
    NoLegacyIdentity(Uuid),
    #[error("identity mapping conflict: legacy {legacy_user_id} / user {user_id} collides with existing {} -> {}", .existing.legacy_user_id, .existing.user_id)]
    MappingConflict {
        legacy_user_id: String,
        user_id: Uuid,
        existing: UserMapping,
    },
    #[error(transparent)]
    Store(#[from] AuthStoreError),
}

/// What to do when a sync would remap an identity that is already mapped
/// elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingConflictPolicy {
    Reject,
    /// Keep the stored mapping and carry on.
    Ignore,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReport {
    pub primary_sessions_removed: Option<u64>,
    pub legacy_sessions_removed: Option<u64>,
    pub legacy_user_id: Option<String>,
}

impl InvalidationReport {
    /// Every store that holds sessions for the user was cleared.
    pub fn is_complete(&self) -> bool {
        self.primary_sessions_removed.is_some()
            && (self.legacy_user_id.is_none() || self.legacy_sessions_removed.is_some())
    }
}

#[derive(Clone)]
pub struct SessionBridge {
    primary: Arc<dyn PrimaryAuthRepository>,
    legacy: Arc<dyn LegacyAuthRepository>,
    mappings: Arc<dyn UserMappingRepository>,
    policy: MappingConflictPolicy,
    session_ttl: Duration,
}

impl SessionBridge {
    pub fn new(
        primary: Arc<dyn PrimaryAuthRepository>,
        legacy: Arc<dyn LegacyAuthRepository>,
        mappings: Arc<dyn UserMappingRepository>,
        policy: MappingConflictPolicy,
        session_ttl: Duration,
    ) -> Self {
        Self {
            primary,
            legacy,
            mappings,
            policy,
            session_ttl,
        }
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// Primary store first. Tokens it does not know (or cannot be asked about)
    /// fall back to the legacy store, syncing the user across on the way.
    pub async fn validate_session(
        &self,
        token: &str,
    ) -> Result<Option<UnifiedSession>, SessionBridgeError> {
        match self.primary.find_session(token).await {
            Ok(Some(session)) => return self.unify_primary(session).await.map(Some),
            Ok(None) => {}
            Err(err) => warn!(?err, "primary session lookup failed, trying legacy store"),
        }

        let Some(session) = self
            .legacy
            .find_session(token)
            .await
            .map_err(AuthStoreError::Legacy)?
        else {
            return Ok(None);
        };
        if session.is_expired(OffsetDateTime::now_utc()) {
            debug!(legacy_user_id = %session.user_id, "legacy session expired");
            return Ok(None);
        }

        let legacy_user = self
            .legacy
            .find_user(&session.user_id)
            .await
            .map_err(AuthStoreError::Legacy)?
            .ok_or_else(|| SessionBridgeError::LegacyUserNotFound(session.user_id.clone()))?;
        let user_id = self.sync_legacy_user(&legacy_user).await?;

        Ok(Some(UnifiedSession {
            user_id,
            legacy_user_id: Some(legacy_user.id),
            email: Some(legacy_user.email),
            source: SessionSource::Legacy,
            state: SessionState::Valid,
            primary_session_id: None,
            primary_token: None,
            legacy_token: Some(session.session_token),
            expires_at: session.expires,
        }))
    }

    /// Opens a primary session and, when the user has a legacy identity, a
    /// matching legacy one. The legacy half is best-effort.
    pub async fn create_unified_session(
        &self,
        user_id: Uuid,
        data: serde_json::Value,
    ) -> Result<UnifiedSession, SessionBridgeError> {
        let user = self
            .primary
            .find_user(user_id)
            .await
            .map_err(AuthStoreError::Primary)?;
        let session = self
            .primary
            .create_session(user_id, data, self.session_ttl)
            .await
            .map_err(AuthStoreError::Primary)?;

        let mapping = self
            .mappings
            .find_by_user_id(user_id)
            .await
            .map_err(AuthStoreError::Mapping)?;
        let legacy_token = match &mapping {
            Some(mapping) => match self
                .legacy
                .create_session(&mapping.legacy_user_id, self.session_ttl)
                .await
            {
                Ok(legacy) => Some(legacy.session_token),
                Err(err) => {
                    warn!(%user_id, legacy_user_id = %mapping.legacy_user_id, ?err, "legacy session mirror failed");
                    None
                }
            },
            None => None,
        };

        info!(%user_id, session_id = %session.id, mirrored = legacy_token.is_some(), "unified session created");
        Ok(UnifiedSession {
            user_id,
            legacy_user_id: mapping.map(|m| m.legacy_user_id),
            email: user.map(|u| u.email),
            source: SessionSource::Primary,
            state: SessionState::Valid,
            primary_session_id: Some(session.id),
            primary_token: Some(session.token),
            legacy_token,
            expires_at: session.expires_at,
        })
    }

    /// Issues a primary session for a live legacy session. The new session
    /// never outlives the legacy one it was converted from.
    pub async fn convert_legacy_session_to_new(
        &self,
        legacy_token: &str,
    ) -> Result<UnifiedSession, SessionBridgeError> {
        let legacy = self
            .legacy
            .find_session(legacy_token)
            .await
            .map_err(AuthStoreError::Legacy)?
            .ok_or(SessionBridgeError::SessionNotFound)?;
        let now = OffsetDateTime::now_utc();
        if legacy.is_expired(now) {
            return Err(SessionBridgeError::SessionExpired);
        }

        let legacy_user = self
            .legacy
            .find_user(&legacy.user_id)
            .await
            .map_err(AuthStoreError::Legacy)?
            .ok_or_else(|| SessionBridgeError::LegacyUserNotFound(legacy.user_id.clone()))?;
        let user_id = self.sync_legacy_user(&legacy_user).await?;

        let ttl = (legacy.expires - now).min(self.session_ttl);
        let session = self
            .primary
            .create_session(
                user_id,
                json!({"convertedFrom": "legacy", "legacyUserId": legacy_user.id}),
                ttl,
            )
            .await
            .map_err(AuthStoreError::Primary)?;

        info!(%user_id, legacy_user_id = %legacy_user.id, "legacy session converted");
        Ok(UnifiedSession {
            user_id,
            legacy_user_id: Some(legacy_user.id),
            email: Some(legacy_user.email),
            source: SessionSource::Primary,
            state: SessionState::Valid,
            primary_session_id: Some(session.id),
            primary_token: Some(session.token),
            legacy_token: Some(legacy.session_token),
            expires_at: session.expires_at,
        })
    }

    /// Lossy: the legacy store keeps only user id and expiry, so session data
    /// is dropped.
    pub async fn convert_new_session_to_legacy(
        &self,
        primary_token: &str,
    ) -> Result<LegacySession, SessionBridgeError> {
        let session = self
            .primary
            .find_session(primary_token)
            .await
            .map_err(AuthStoreError::Primary)?
            .ok_or(SessionBridgeError::SessionNotFound)?;
        let mapping = self
            .mappings
            .find_by_user_id(session.user_id)
            .await
            .map_err(AuthStoreError::Mapping)?
            .ok_or(SessionBridgeError::NoLegacyIdentity(session.user_id))?;

        let ttl = session.expires_at - OffsetDateTime::now_utc();
        if ttl <= Duration::ZERO {
            return Err(SessionBridgeError::SessionExpired);
        }
        if session.data.as_object().is_some_and(|d| !d.is_empty()) {
            debug!(session_id = %session.id, "session data not carried to legacy session");
        }

        let legacy = self
            .legacy
            .create_session(&mapping.legacy_user_id, ttl)
            .await
            .map_err(AuthStoreError::Legacy)?;
        info!(user_id = %session.user_id, legacy_user_id = %mapping.legacy_user_id, "primary session mirrored to legacy");
        Ok(legacy)
    }

    /// Re-checks the stores behind a unified view. The view goes invalid once
    /// its primary session is gone or expired; legacy-only views follow the
    /// legacy session.
    pub async fn sync_session_state(
        &self,
        session: &UnifiedSession,
    ) -> Result<UnifiedSession, SessionBridgeError> {
        let now = OffsetDateTime::now_utc();
        let mut synced = session.clone();

        let live_until = match (&session.primary_token, &session.legacy_token) {
            (Some(token), _) => self
                .primary
                .find_session(token)
                .await
                .map_err(AuthStoreError::Primary)?
                .filter(|s| !s.is_expired(now))
                .map(|s| s.expires_at),
            (None, Some(token)) => self
                .legacy
                .find_session(token)
                .await
                .map_err(AuthStoreError::Legacy)?
                .filter(|s| !s.is_expired(now))
                .map(|s| s.expires),
            (None, None) => None,
        };

        match live_until {
            Some(expires_at) => {
                synced.expires_at = expires_at;
                synced.state = SessionState::Valid;
            }
            None => {
                if session.is_valid() {
                    info!(user_id = %session.user_id, "underlying session gone, expiring unified view");
                }
                synced.state = SessionState::Invalid;
            }
        }
        Ok(synced)
    }

    /// Deletes the user's sessions in both stores. A failure on one side is
    /// logged and does not stop the other.
    pub async fn invalidate_all_sessions(&self, user_id: Uuid) -> InvalidationReport {
        let mut report = InvalidationReport::default();

        match self.primary.delete_user_sessions(user_id).await {
            Ok(removed) => report.primary_sessions_removed = Some(removed),
            Err(err) => error!(%user_id, ?err, "failed to delete primary sessions"),
        }

        match self.mappings.find_by_user_id(user_id).await {
            Ok(Some(mapping)) => {
                match self.legacy.delete_user_sessions(&mapping.legacy_user_id).await {
                    Ok(removed) => report.legacy_sessions_removed = Some(removed),
                    Err(err) => error!(
                        %user_id,
                        legacy_user_id = %mapping.legacy_user_id,
                        ?err,
                        "failed to delete legacy sessions"
                    ),
                }
                report.legacy_user_id = Some(mapping.legacy_user_id);
            }
            Ok(None) => {}
            Err(err) => error!(%user_id, ?err, "failed to resolve legacy identity for logout"),
        }

        info!(
            %user_id,
            primary = report.primary_sessions_removed,
            legacy = report.legacy_sessions_removed,
            complete = report.is_complete(),
            "sessions invalidated"
        );
        report
    }

    async fn unify_primary(
        &self,
        session: PrimarySession,
    ) -> Result<UnifiedSession, SessionBridgeError> {
        let user = self
            .primary
            .find_user(session.user_id)
            .await
            .map_err(AuthStoreError::Primary)?;
        let mapping = self
            .mappings
            .find_by_user_id(session.user_id)
            .await
            .map_err(AuthStoreError::Mapping)?;

        Ok(UnifiedSession {
            user_id: session.user_id,
            legacy_user_id: mapping.map(|m| m.legacy_user_id),
            email: user.map(|u| u.email),
            source: SessionSource::Primary,
            state: SessionState::Valid,
            primary_session_id: Some(session.id),
            primary_token: Some(session.token),
            legacy_token: None,
            expires_at: session.expires_at,
        })
    }

    /// Resolves the primary user for a legacy one, creating the user and the
    /// mapping on first sight.
    async fn sync_legacy_user(&self, legacy_user: &LegacyUser) -> Result<Uuid, SessionBridgeError> {
        if let Some(mapping) = self
            .mappings
            .find_by_legacy_id(&legacy_user.id)
            .await
            .map_err(AuthStoreError::Mapping)?
        {
            return Ok(mapping.user_id);
        }

        let user = match self
            .primary
            .find_user_by_email(&legacy_user.email)
            .await
            .map_err(AuthStoreError::Primary)?
        {
            Some(user) => user,
            None => {
                let user = self
                    .primary
                    .create_user(&legacy_user.email, legacy_user.name.as_deref(), true)
                    .await
                    .map_err(AuthStoreError::Primary)?;
                info!(user_id = %user.id, legacy_user_id = %legacy_user.id, "created primary user from legacy identity");
                user
            }
        };

        match self
            .mappings
            .create_mapping(&legacy_user.id, user.id)
            .await
            .map_err(AuthStoreError::Mapping)?
        {
            MappingInsert::Created(_) | MappingInsert::Existing(_) => Ok(user.id),
            MappingInsert::Conflict(existing) => match self.policy {
                MappingConflictPolicy::Reject => {
                    warn!(
                        mapping_conflict = true,
                        legacy_user_id = %legacy_user.id,
                        user_id = %user.id,
                        existing_legacy_user_id = %existing.legacy_user_id,
                        existing_user_id = %existing.user_id,
                        "identity mapping conflict, rejecting"
                    );
                    Err(SessionBridgeError::MappingConflict {
                        legacy_user_id: legacy_user.id.clone(),
                        user_id: user.id,
                        existing,
                    })
                }
                MappingConflictPolicy::Ignore => {
                    warn!(
                        mapping_conflict = true,
                        legacy_user_id = %legacy_user.id,
                        user_id = %user.id,
                        existing_legacy_user_id = %existing.legacy_user_id,
                        existing_user_id = %existing.user_id,
                        "identity mapping conflict, keeping stored mapping"
                    );
                    if existing.legacy_user_id == legacy_user.id {
                        Ok(existing.user_id)
                    } else {
                        Ok(user.id)
                    }
                }
            },
        }
    }
}

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::db::auth_repository::{LegacyAuthRepository, PrimaryAuthRepository};
use crate::db::user_mapping_repository::{MappingInsert, UserMappingRepository};
use crate::models::session::{AuthUser, LegacySession, LegacyUser, PrimarySession, UserMapping};
use crate::utils::token::generate_session_token;

#[derive(Default)]
pub struct AuthState {
    pub users: Vec<AuthUser>,
    pub sessions: Vec<PrimarySession>,
    pub legacy_users: Vec<LegacyUser>,
    pub legacy_sessions: Vec<LegacySession>,
    pub mappings: Vec<UserMapping>,
}

/// Both auth systems plus the identity mapping table, in memory. Each side can
/// be made to fail independently.
#[derive(Clone, Default)]
pub struct MockAuthDb {
    pub state: Arc<Mutex<AuthState>>,
    pub fail_primary: Arc<Mutex<bool>>,
    pub fail_legacy: Arc<Mutex<bool>>,
}

impl MockAuthDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_primary(&self, fail: bool) {
        *self.fail_primary.lock().unwrap() = fail;
    }

    pub fn set_fail_legacy(&self, fail: bool) {
        *self.fail_legacy.lock().unwrap() = fail;
    }

    fn check_primary(&self) -> Result<(), sqlx::Error> {
        if *self.fail_primary.lock().unwrap() {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(())
    }

    fn check_legacy(&self) -> Result<(), sqlx::Error> {
        if *self.fail_legacy.lock().unwrap() {
            return Err(sqlx::Error::PoolTimedOut);
        }
        Ok(())
    }

    pub fn add_user(&self, email: &str) -> AuthUser {
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: None,
            email_verified: true,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().unwrap().users.push(user.clone());
        user
    }

    pub fn add_legacy_user(&self, id: &str, email: &str) -> LegacyUser {
        let user = LegacyUser {
            id: id.to_string(),
            email: email.to_string(),
            name: Some("Legacy User".to_string()),
        };
        self.state.lock().unwrap().legacy_users.push(user.clone());
        user
    }

    pub fn add_legacy_session(&self, user_id: &str, token: &str, ttl: Duration) -> LegacySession {
        let session = LegacySession {
            session_token: token.to_string(),
            user_id: user_id.to_string(),
            expires: OffsetDateTime::now_utc() + ttl,
        };
        self.state.lock().unwrap().legacy_sessions.push(session.clone());
        session
    }

    pub fn add_mapping(&self, legacy_user_id: &str, user_id: Uuid) {
        self.state.lock().unwrap().mappings.push(UserMapping {
            legacy_user_id: legacy_user_id.to_string(),
            user_id,
            created_at: OffsetDateTime::now_utc(),
        });
    }

    /// Rewrites a stored primary session's expiry, bypassing the store API.
    pub fn expire_session(&self, token: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.iter_mut().find(|s| s.token == token) {
            session.expires_at = OffsetDateTime::now_utc() - Duration::minutes(1);
        }
    }
}

#[async_trait]
impl PrimaryAuthRepository for MockAuthDb {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<AuthUser>, sqlx::Error> {
        self.check_primary()?;
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<AuthUser>, sqlx::Error> {
        self.check_primary()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        email_verified: bool,
    ) -> Result<AuthUser, sqlx::Error> {
        self.check_primary()?;
        let user = AuthUser {
            id: Uuid::new_v4(),
            email: email.to_string(),
            name: name.map(str::to_string),
            email_verified,
            created_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().unwrap().users.push(user.clone());
        Ok(user)
    }

    async fn create_session(
        &self,
        user_id: Uuid,
        data: Value,
        ttl: Duration,
    ) -> Result<PrimarySession, sqlx::Error> {
        self.check_primary()?;
        let now = OffsetDateTime::now_utc();
        let session = PrimarySession {
            id: Uuid::new_v4(),
            token: generate_session_token(),
            user_id,
            data,
            expires_at: now + ttl,
            created_at: now,
        };
        self.state.lock().unwrap().sessions.push(session.clone());
        Ok(session)
    }

    async fn find_session(&self, token: &str) -> Result<Option<PrimarySession>, sqlx::Error> {
        self.check_primary()?;
        let mut state = self.state.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        state
            .sessions
            .retain(|s| !(s.token == token && s.is_expired(now)));
        Ok(state.sessions.iter().find(|s| s.token == token).cloned())
    }

    async fn delete_session(&self, token: &str) -> Result<bool, sqlx::Error> {
        self.check_primary()?;
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.token != token);
        Ok(state.sessions.len() < before)
    }

    async fn delete_user_sessions(&self, user_id: Uuid) -> Result<u64, sqlx::Error> {
        self.check_primary()?;
        let mut state = self.state.lock().unwrap();
        let before = state.sessions.len();
        state.sessions.retain(|s| s.user_id != user_id);
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl LegacyAuthRepository for MockAuthDb {
    async fn find_user(&self, user_id: &str) -> Result<Option<LegacyUser>, sqlx::Error> {
        self.check_legacy()?;
        let state = self.state.lock().unwrap();
        Ok(state.legacy_users.iter().find(|u| u.id == user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<LegacyUser>, sqlx::Error> {
        self.check_legacy()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .legacy_users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_session(&self, token: &str) -> Result<Option<LegacySession>, sqlx::Error> {
        self.check_legacy()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .legacy_sessions
            .iter()
            .find(|s| s.session_token == token)
            .cloned())
    }

    async fn create_session(
        &self,
        user_id: &str,
        ttl: Duration,
    ) -> Result<LegacySession, sqlx::Error> {
        self.check_legacy()?;
        Ok(self.add_legacy_session(user_id, &generate_session_token(), ttl))
    }

    async fn delete_user_sessions(&self, user_id: &str) -> Result<u64, sqlx::Error> {
        self.check_legacy()?;
        let mut state = self.state.lock().unwrap();
        let before = state.legacy_sessions.len();
        state.legacy_sessions.retain(|s| s.user_id != user_id);
        Ok((before - state.legacy_sessions.len()) as u64)
    }
}

#[async_trait]
impl UserMappingRepository for MockAuthDb {
    async fn find_by_legacy_id(
        &self,
        legacy_user_id: &str,
    ) -> Result<Option<UserMapping>, sqlx::Error> {
        self.check_primary()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .mappings
            .iter()
            .find(|m| m.legacy_user_id == legacy_user_id)
            .cloned())
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<UserMapping>, sqlx::Error> {
        self.check_primary()?;
        let state = self.state.lock().unwrap();
        Ok(state.mappings.iter().find(|m| m.user_id == user_id).cloned())
    }

    async fn create_mapping(
        &self,
        legacy_user_id: &str,
        user_id: Uuid,
    ) -> Result<MappingInsert, sqlx::Error> {
        self.check_primary()?;
        let mut state = self.state.lock().unwrap();
        let existing = state
            .mappings
            .iter()
            .find(|m| m.legacy_user_id == legacy_user_id || m.user_id == user_id)
            .cloned();
        match existing {
            Some(m) if m.legacy_user_id == legacy_user_id && m.user_id == user_id => {
                Ok(MappingInsert::Existing(m))
            }
            Some(m) => Ok(MappingInsert::Conflict(m)),
            None => {
                let mapping = UserMapping {
                    legacy_user_id: legacy_user_id.to_string(),
                    user_id,
                    created_at: OffsetDateTime::now_utc(),
                };
                state.mappings.push(mapping.clone());
                Ok(MappingInsert::Created(mapping))
            }
        }
    }
}

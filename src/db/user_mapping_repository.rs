use async_trait::async_trait;
use uuid::Uuid;

use crate::models::session::UserMapping;

#[derive(Debug, Clone, PartialEq)]
pub enum MappingInsert {
    Created(UserMapping),
    /// The exact pair was already stored.
    Existing(UserMapping),
    /// One side is already mapped to a different identity; nothing was written.
    Conflict(UserMapping),
}

#[async_trait]
pub trait UserMappingRepository: Send + Sync {
    async fn find_by_legacy_id(
        &self,
        legacy_user_id: &str,
    ) -> Result<Option<UserMapping>, sqlx::Error>;

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<UserMapping>, sqlx::Error>;

    /// Mappings are never overwritten once set.
    async fn create_mapping(
        &self,
        legacy_user_id: &str,
        user_id: Uuid,
    ) -> Result<MappingInsert, sqlx::Error>;
}

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::user_mapping_repository::{MappingInsert, UserMappingRepository};
use crate::models::session::UserMapping;

pub struct PostgresUserMappingRepository {
    pub pool: PgPool,
}

#[async_trait]
impl UserMappingRepository for PostgresUserMappingRepository {
    async fn find_by_legacy_id(
        &self,
        legacy_user_id: &str,
    ) -> Result<Option<UserMapping>, sqlx::Error> {
        sqlx::query_as::<_, UserMapping>(
            "SELECT legacy_user_id, user_id, created_at FROM user_mappings WHERE legacy_user_id = $1",
        )
        .bind(legacy_user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn find_by_user_id(&self, user_id: Uuid) -> Result<Option<UserMapping>, sqlx::Error> {
        sqlx::query_as::<_, UserMapping>(
            "SELECT legacy_user_id, user_id, created_at FROM user_mappings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_mapping(
        &self,
        legacy_user_id: &str,
        user_id: Uuid,
    ) -> Result<MappingInsert, sqlx::Error> {
        // Both columns carry unique indexes; a conflict on either leaves the
        // stored row untouched.
        let inserted = sqlx::query_as::<_, UserMapping>(
            r#"
            INSERT INTO user_mappings (legacy_user_id, user_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            RETURNING legacy_user_id, user_id, created_at
            "#,
        )
        .bind(legacy_user_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(mapping) = inserted {
            return Ok(MappingInsert::Created(mapping));
        }

        let existing = match self.find_by_legacy_id(legacy_user_id).await? {
            Some(mapping) => mapping,
            None => self
                .find_by_user_id(user_id)
                .await?
                .ok_or(sqlx::Error::RowNotFound)?,
        };

        if existing.legacy_user_id == legacy_user_id && existing.user_id == user_id {
            Ok(MappingInsert::Existing(existing))
        } else {
            Ok(MappingInsert::Conflict(existing))
        }
    }
}

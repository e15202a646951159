//! Role membership and reporting lines kept in SQLite.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;

use expensa_core::domain::actor::ActorId;
use expensa_core::targets::{normalize_key, Directory, DirectoryError};

use crate::store::timestamp;
use crate::DbPool;

pub struct SqlDirectory {
    pool: DbPool,
}

impl SqlDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn grant_role(&self, role: &str, actor: &ActorId) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO directory_role_member (role, actor_id, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(role, actor_id) DO NOTHING",
        )
        .bind(normalize_key(role))
        .bind(actor.as_str())
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_role(&self, role: &str, actor: &ActorId) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM directory_role_member WHERE role = ? AND actor_id = ?")
                .bind(normalize_key(role))
                .bind(actor.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Replaces any existing `relation` edge of `actor`.
    pub async fn set_relationship(
        &self,
        actor: &ActorId,
        relation: &str,
        target: &ActorId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO directory_relationship (actor_id, relation, target_id, created_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(actor_id, relation) DO UPDATE SET
                target_id = excluded.target_id,
                created_at = excluded.created_at",
        )
        .bind(actor.as_str())
        .bind(normalize_key(relation))
        .bind(target.as_str())
        .bind(timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn clear_relationship(
        &self,
        actor: &ActorId,
        relation: &str,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM directory_relationship WHERE actor_id = ? AND relation = ?")
                .bind(actor.as_str())
                .bind(normalize_key(relation))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn unavailable(error: sqlx::Error) -> DirectoryError {
    DirectoryError::Unavailable(error.to_string())
}

#[async_trait]
impl Directory for SqlDirectory {
    async fn members_of_role(&self, role: &str) -> Result<BTreeSet<ActorId>, DirectoryError> {
        let rows = sqlx::query(
            "SELECT actor_id FROM directory_role_member WHERE role = ? ORDER BY actor_id ASC",
        )
        .bind(normalize_key(role))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("actor_id").map(ActorId::new).map_err(unavailable))
            .collect()
    }

    async fn relationship_target(
        &self,
        actor: &ActorId,
        relation: &str,
    ) -> Result<Option<ActorId>, DirectoryError> {
        let row = sqlx::query(
            "SELECT target_id FROM directory_relationship WHERE actor_id = ? AND relation = ?",
        )
        .bind(actor.as_str())
        .bind(normalize_key(relation))
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|row| row.try_get::<String, _>("target_id").map(ActorId::new).map_err(unavailable))
            .transpose()
    }
}

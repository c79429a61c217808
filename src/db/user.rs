//! Session / user persistence

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::UserRow;
use super::repository::{tombstone_email, UserStore};
use super::Database;
use crate::error::ApiResult;
use crate::types::User;

#[async_trait]
impl UserStore for Database {
    async fn user_by_session(&self, token_hash: &str, now: DateTime<Utc>) -> ApiResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT u.id, u.email, u.lemon_balance, u.last_harvest_at, u.created_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1 AND s.expires_at > $2 AND NOT u.is_deleted
            "#,
        )
        .bind(token_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    async fn find_user(&self, user_id: Uuid) -> ApiResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, email, lemon_balance, last_harvest_at, created_at
            FROM users
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(User::from))
    }

    async fn delete_session(&self, token_hash: &str) -> ApiResult<()> {
        sqlx::query("DELETE FROM sessions WHERE token_hash = $1")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn soft_delete_user(&self, user_id: Uuid, at: DateTime<Utc>) -> ApiResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE users
            SET is_deleted = TRUE, email = $2, updated_at = $3
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(user_id)
        .bind(tombstone_email(user_id, at))
        .bind(at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM sessions WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> ApiResult<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

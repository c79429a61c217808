//! Ledger persistence
//!
//! 잔액 변경은 `apply_in_tx` 하나로만 일어난다. 수확 트랜잭션도 같은 헬퍼를 사용

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use super::models::LedgerRow;
use super::repository::LedgerStore;
use super::Database;
use crate::error::{ApiError, ApiResult};
use crate::types::{LedgerEntry, LedgerRequest, TxStatus, MAX_STORED_LEMONS};

/// 열린 트랜잭션 안에서 잔액 변경 + 원장 기록
///
/// 1. 사용자 row lock (FOR UPDATE)
/// 2. 새 잔액 계산, 범위 검사
/// 3. 원장 insert
/// 4. 사용자 잔액 update
pub(super) async fn apply_in_tx(conn: &mut PgConnection, req: &LedgerRequest) -> ApiResult<LedgerEntry> {
    let balance: Option<(i64,)> = sqlx::query_as(
        "SELECT lemon_balance FROM users WHERE id = $1 AND NOT is_deleted FOR UPDATE",
    )
    .bind(req.user_id)
    .fetch_optional(&mut *conn)
    .await?;

    let (balance,) = balance.ok_or_else(|| ApiError::not_found("user", req.user_id))?;

    let new_balance = balance + req.delta;
    if new_balance < 0 {
        return Err(ApiError::insufficient(-req.delta as f64, balance));
    }
    if new_balance > MAX_STORED_LEMONS {
        return Err(ApiError::StorageFull { max_lemons: MAX_STORED_LEMONS });
    }

    let row = sqlx::query_as::<_, LedgerRow>(
        r#"
        INSERT INTO user_lemon_transactions
            (user_id, db_instance_id, action_type, status, amount, balance, note)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id, user_id, db_instance_id, action_type, status, amount, balance, created_at, note
        "#,
    )
    .bind(req.user_id)
    .bind(req.instance_id)
    .bind(req.action.as_str())
    .bind(TxStatus::Successful.as_str())
    .bind(req.delta)
    .bind(new_balance)
    .bind(&req.note)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE users SET lemon_balance = $2, updated_at = NOW() WHERE id = $1")
        .bind(req.user_id)
        .bind(new_balance)
        .execute(&mut *conn)
        .await?;

    row.try_into()
}

#[async_trait]
impl LedgerStore for Database {
    async fn apply(&self, req: &LedgerRequest) -> ApiResult<LedgerEntry> {
        let mut tx = self.pool.begin().await?;
        let entry = apply_in_tx(&mut *tx, req).await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn record_failed(&self, req: &LedgerRequest) -> ApiResult<LedgerEntry> {
        let row = sqlx::query_as::<_, LedgerRow>(
            r#"
            INSERT INTO user_lemon_transactions
                (user_id, db_instance_id, action_type, status, amount, balance, note)
            SELECT id, $2, $3, $4, $5, lemon_balance, $6
            FROM users WHERE id = $1
            RETURNING id, user_id, db_instance_id, action_type, status, amount, balance, created_at, note
            "#,
        )
        .bind(req.user_id)
        .bind(req.instance_id)
        .bind(req.action.as_str())
        .bind(TxStatus::Failed.as_str())
        .bind(req.delta)
        .bind(&req.note)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| ApiError::not_found("user", req.user_id))?;

        row.try_into()
    }

    async fn balance(&self, user_id: Uuid) -> ApiResult<i64> {
        let balance: Option<(i64,)> =
            sqlx::query_as("SELECT lemon_balance FROM users WHERE id = $1 AND NOT is_deleted")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        balance
            .map(|(b,)| b)
            .ok_or_else(|| ApiError::not_found("user", user_id))
    }

    async fn list_entries(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> ApiResult<(Vec<LedgerEntry>, i64)> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            r#"
            SELECT id, user_id, db_instance_id, action_type, status, amount, balance, created_at, note
            FROM user_lemon_transactions
            WHERE user_id = $1
            ORDER BY id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM user_lemon_transactions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;

        let entries = rows
            .into_iter()
            .map(LedgerEntry::try_from)
            .collect::<ApiResult<Vec<_>>>()?;

        Ok((entries, count.0))
    }
}

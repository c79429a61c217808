//! Lemon tree persistence
//!
//! # Lock order
//!
//! 수확 트랜잭션은 항상 사용자 row → 위치 row 순서로 잠근다.
//! 원장 헬퍼가 사용자 row 를 다시 잠가도 같은 트랜잭션이므로 대기하지 않음

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ledger::apply_in_tx;
use super::repository::{HarvestClaim, LemonStore};
use super::Database;
use crate::error::{ApiError, ApiResult};
use crate::types::{ActionType, HarvestOutcome, LedgerRequest, TxStatus};

#[async_trait]
impl LemonStore for Database {
    async fn claim_harvest(&self, claim: &HarvestClaim) -> ApiResult<HarvestOutcome> {
        let mut tx = self.pool.begin().await?;

        let user: Option<(i64, Option<DateTime<Utc>>)> = sqlx::query_as(
            r#"
            SELECT lemon_balance, last_harvest_at
            FROM users
            WHERE id = $1 AND NOT is_deleted
            FOR UPDATE
            "#,
        )
        .bind(claim.user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (balance, last_harvest_at) =
            user.ok_or_else(|| ApiError::not_found("user", claim.user_id))?;

        if let Some(wait) = claim.rules.cooldown_remaining(last_harvest_at, claim.now) {
            return Err(ApiError::HarvestCooldown {
                wait_seconds: wait.num_seconds().max(1),
            });
        }

        // 위치를 건드리기 전에 창고 한도 확인
        let amount = claim.rules.clamp_amount(balance);
        if amount == 0 {
            return Err(ApiError::StorageFull {
                max_lemons: claim.rules.max_stored_lemons,
            });
        }

        let position: Option<(bool,)> =
            sqlx::query_as("SELECT is_available FROM lemons WHERE position_id = $1 FOR UPDATE")
                .bind(claim.position_id)
                .fetch_optional(&mut *tx)
                .await?;

        match position {
            None => return Err(ApiError::not_found("position", claim.position_id)),
            Some((false,)) => return Err(ApiError::AlreadyHarvested),
            Some((true,)) => {}
        }

        let next_available_at = claim.now + claim.rules.cooldown;

        sqlx::query(
            r#"
            UPDATE lemons
            SET is_available = FALSE,
                last_harvested_at = $2,
                next_available_at = $3,
                current_quiz_id = NULL
            WHERE position_id = $1
            "#,
        )
        .bind(claim.position_id)
        .bind(claim.now)
        .bind(next_available_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET last_harvest_at = $2 WHERE id = $1")
            .bind(claim.user_id)
            .bind(claim.now)
            .execute(&mut *tx)
            .await?;

        let entry = apply_in_tx(
            &mut *tx,
            &LedgerRequest {
                user_id: claim.user_id,
                delta: amount,
                action: ActionType::Harvest,
                note: Some(format!("position {}", claim.position_id)),
                instance_id: None,
            },
        )
        .await?;

        tx.commit().await?;

        Ok(HarvestOutcome {
            position_id: claim.position_id,
            harvested_amount: amount,
            new_balance: entry.balance,
            transaction_id: entry.id,
            next_available_at,
        })
    }

    async fn regrow(&self, now: DateTime<Utc>) -> ApiResult<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            r#"
            UPDATE lemons
            SET is_available = TRUE, next_available_at = NULL
            WHERE is_available = FALSE AND next_available_at <= $1
            RETURNING position_id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut positions: Vec<i32> = rows.into_iter().map(|(p,)| p).collect();
        positions.sort_unstable();
        Ok(positions)
    }

    async fn assign_quizzes(&self) -> ApiResult<u64> {
        // 상관 서브쿼리라 위치마다 따로 뽑힘
        let result = sqlx::query(
            r#"
            UPDATE lemons l
            SET current_quiz_id = (
                SELECT q.id FROM quizzes q
                WHERE l.position_id IS NOT NULL
                ORDER BY random()
                LIMIT 1
            )
            WHERE l.is_available AND l.current_quiz_id IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn tree_snapshot(&self) -> ApiResult<(Vec<i32>, Option<DateTime<Utc>>)> {
        let available: Vec<(i32,)> = sqlx::query_as(
            "SELECT position_id FROM lemons WHERE is_available ORDER BY position_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let next: (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MIN(next_available_at) FROM lemons WHERE NOT is_available",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok((available.into_iter().map(|(p,)| p).collect(), next.0))
    }

    async fn total_harvested(&self) -> ApiResult<i64> {
        let total: (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(amount)::BIGINT
            FROM user_lemon_transactions
            WHERE action_type = $1 AND status = $2
            "#,
        )
        .bind(ActionType::Harvest.as_str())
        .bind(TxStatus::Successful.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(total.0.unwrap_or(0))
    }

    async fn position_available(&self, position_id: i32) -> ApiResult<Option<bool>> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_available FROM lemons WHERE position_id = $1")
                .bind(position_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(a,)| a))
    }
}

//! Quiz persistence (문항 + 통계용 시도 기록)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{AttemptRow, QuizRow};
use super::repository::QuizStore;
use super::Database;
use crate::error::ApiResult;
use crate::types::{AttemptStatus, HarvestStatus, Quiz, QuizAttempt};

const QUIZ_COLUMNS: &str =
    "q.id, q.question, q.options, q.correct_option_idx, q.difficulty, q.category, q.explanation, q.time_limit";

#[async_trait]
impl QuizStore for Database {
    async fn quiz_for_position(&self, position_id: i32) -> ApiResult<Option<Quiz>> {
        let row = sqlx::query_as::<_, QuizRow>(&format!(
            r#"
            SELECT {QUIZ_COLUMNS}
            FROM lemons l
            JOIN quizzes q ON q.id = l.current_quiz_id
            WHERE l.position_id = $1
            "#
        ))
        .bind(position_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Quiz::try_from).transpose()
    }

    async fn quiz(&self, quiz_id: i64) -> ApiResult<Option<Quiz>> {
        let row = sqlx::query_as::<_, QuizRow>(&format!(
            "SELECT {QUIZ_COLUMNS} FROM quizzes q WHERE q.id = $1"
        ))
        .bind(quiz_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Quiz::try_from).transpose()
    }

    async fn create_attempt(
        &self,
        user_id: Uuid,
        quiz_id: i64,
        position_id: i32,
        start_time: DateTime<Utc>,
    ) -> ApiResult<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO user_quiz_attempts (user_id, quiz_id, position_id, start_time, status, harvest_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(quiz_id)
        .bind(position_id)
        .bind(start_time)
        .bind(AttemptStatus::Started.as_str())
        .bind(HarvestStatus::None.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn find_attempt(&self, user_id: Uuid, attempt_id: i64) -> ApiResult<Option<QuizAttempt>> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT id, user_id, quiz_id, position_id, start_time, submit_time,
                   selected_option, is_correct, status, harvest_status
            FROM user_quiz_attempts
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(attempt_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(QuizAttempt::try_from).transpose()
    }

    async fn complete_attempt(
        &self,
        attempt_id: i64,
        selected_option: i32,
        is_correct: bool,
        status: AttemptStatus,
        submit_time: DateTime<Utc>,
        harvest_status: HarvestStatus,
    ) -> ApiResult<()> {
        sqlx::query(
            r#"
            UPDATE user_quiz_attempts
            SET selected_option = $2, is_correct = $3, status = $4, submit_time = $5, harvest_status = $6
            WHERE id = $1
            "#,
        )
        .bind(attempt_id)
        .bind(selected_option)
        .bind(is_correct)
        .bind(status.as_str())
        .bind(submit_time)
        .bind(harvest_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_harvest_status(
        &self,
        attempt_id: i64,
        status: HarvestStatus,
        at: DateTime<Utc>,
    ) -> ApiResult<()> {
        sqlx::query("UPDATE user_quiz_attempts SET harvest_status = $2, harvest_at = $3 WHERE id = $1")
            .bind(attempt_id)
            .bind(status.as_str())
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

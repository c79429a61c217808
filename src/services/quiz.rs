//! Quiz Gate
//!
//! # Interview Q&A
//!
//! Q: 사용자당 진행 중 퀴즈 1개는 어떻게 보장하는가?
//! A: `quiz:in_progress:{email}` 를 SET NX 로 먼저 예약
//!    - 예약에 성공한 요청만 attempt row 를 만든다 (동시 시작 시 고아 row 없음)
//!    - TTL = 제한 시간 + 3초 여유, 만료되면 자동으로 다시 시작 가능
//!
//! Q: 통과 기록은 왜 몇 초만 유지하는가?
//! A: 퀴즈 통과 → 수확 클릭 사이의 짧은 창(harvest window)만 허용
//!    - 통과 기록 하나 = 수확 한 번 (수확이 소비)
//!
//! Q: 시간 초과 판정 기준은?
//! A: 제출 시각 > 시작 시각 + 제한 시간 → 정답이어도 `timeout`, 통과 기록 없음

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::db::{LemonStore, QuizStore};
use crate::error::{ApiError, ApiResult};
use crate::kv::KvStore;
use crate::types::{
    in_progress_key, passed_key, AttemptStatus, HarvestRules, HarvestStatus, InProgressQuiz,
    QuizStartResponse, SubmitAnswerResponse, User, TIME_BUFFER_SECS,
};

pub struct QuizGate {
    quizzes: Arc<dyn QuizStore>,
    lemons: Arc<dyn LemonStore>,
    kv: Arc<dyn KvStore>,
    rules: HarvestRules,
    harvest_window: Duration,
}

impl QuizGate {
    pub fn new(
        quizzes: Arc<dyn QuizStore>,
        lemons: Arc<dyn LemonStore>,
        kv: Arc<dyn KvStore>,
        rules: HarvestRules,
        harvest_window: Duration,
    ) -> Self {
        Self {
            quizzes,
            lemons,
            kv,
            rules,
            harvest_window,
        }
    }

    /// 위치의 퀴즈 시작
    pub async fn start(&self, user: &User, position_id: i32) -> ApiResult<QuizStartResponse> {
        if !self.rules.is_valid_position(position_id) {
            return Err(ApiError::invalid_param("positionID", "must be between 0 and 9"));
        }

        let now = Utc::now();

        // 수확할 수 없는 사용자는 퀴즈도 풀 필요 없음
        if let Some(wait) = self.rules.cooldown_remaining(user.last_harvest_at, now) {
            return Err(ApiError::HarvestCooldown {
                wait_seconds: wait.num_seconds().max(1),
            });
        }

        match self.lemons.position_available(position_id).await? {
            None => return Err(ApiError::not_found("position", position_id)),
            Some(false) => return Err(ApiError::AlreadyHarvested),
            Some(true) => {}
        }

        let quiz = self
            .quizzes
            .quiz_for_position(position_id)
            .await?
            .ok_or_else(|| ApiError::not_found("quiz", position_id))?;

        let key = in_progress_key(&user.email);
        let ttl = Duration::from_secs(quiz.time_limit.max(1) as u64 + TIME_BUFFER_SECS);
        let mut record = InProgressQuiz {
            quiz_id: quiz.id,
            position_id,
            start_time: now,
            attempt_id: 0,
        };

        if !self.kv.set_nx(&key, &serde_json::to_string(&record)?, ttl).await? {
            return Err(ApiError::QuizInProgress);
        }

        let attempt_id = match self
            .quizzes
            .create_attempt(user.id, quiz.id, position_id, now)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // 예약 해제 후 에러 전파
                if let Err(del_err) = self.kv.del(&key).await {
                    tracing::warn!(error = %del_err, "failed to release quiz reservation");
                }
                return Err(e);
            }
        };

        record.attempt_id = attempt_id;
        self.kv.replace(&key, &serde_json::to_string(&record)?).await?;

        tracing::info!(user_id = %user.id, position = position_id, attempt_id, "quiz started");

        Ok(QuizStartResponse {
            attempt_id,
            position_id,
            question: quiz.question,
            options: quiz.options,
            time_limit: quiz.time_limit,
            start_time: now,
        })
    }

    /// 답안 제출
    pub async fn submit(&self, user: &User, option_idx: i32) -> ApiResult<SubmitAnswerResponse> {
        let key = in_progress_key(&user.email);

        let raw = self.kv.get(&key).await?.ok_or(ApiError::NoQuizInProgress)?;
        let record: InProgressQuiz = serde_json::from_str(&raw)?;

        let quiz = self
            .quizzes
            .quiz(record.quiz_id)
            .await?
            .ok_or_else(|| ApiError::not_found("quiz", record.quiz_id))?;

        if option_idx < 0 || option_idx as usize >= quiz.options.len() {
            return Err(ApiError::invalid_param("option_idx", "out of range"));
        }

        // 동시 제출 시 한 요청만 소비
        if self.kv.get_del(&key).await?.is_none() {
            return Err(ApiError::NoQuizInProgress);
        }

        let now = Utc::now();
        let deadline = record.start_time + chrono::Duration::seconds(quiz.time_limit as i64);
        let is_correct = option_idx == quiz.correct_option_idx;
        let timed_out = now > deadline;

        let (status, harvest_status) = if timed_out {
            (AttemptStatus::Timeout, HarvestStatus::None)
        } else if is_correct {
            (AttemptStatus::Done, HarvestStatus::InProgress)
        } else {
            (AttemptStatus::Done, HarvestStatus::None)
        };

        let harvest_enabled = harvest_status == HarvestStatus::InProgress;
        let harvest_timeout_at = if harvest_enabled {
            self.kv
                .set(
                    &passed_key(record.position_id, &user.email),
                    &now.to_rfc3339(),
                    self.harvest_window,
                )
                .await?;
            Some(now + chrono::Duration::milliseconds(self.harvest_window.as_millis() as i64))
        } else {
            None
        };

        if record.attempt_id > 0 {
            self.quizzes
                .complete_attempt(record.attempt_id, option_idx, is_correct, status, now, harvest_status)
                .await?;
        }

        tracing::info!(
            user_id = %user.id,
            position = record.position_id,
            attempt_id = record.attempt_id,
            is_correct,
            timed_out,
            "quiz answered"
        );

        Ok(SubmitAnswerResponse {
            is_correct,
            correct_option: quiz.correct_option_idx,
            explanation: quiz.explanation,
            status,
            harvest_enabled,
            harvest_timeout_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockStore;
    use crate::kv::MemoryStore;
    use crate::services::HarvestEngine;

    fn gate(store: &Arc<MockStore>, kv: &Arc<MemoryStore>) -> QuizGate {
        QuizGate::new(
            store.clone(),
            store.clone(),
            kv.clone(),
            HarvestRules::default(),
            Duration::from_secs(5),
        )
    }

    fn setup() -> (Arc<MockStore>, Arc<MemoryStore>, QuizGate, User) {
        let store = Arc::new(MockStore::new());
        let kv = Arc::new(MemoryStore::new());
        let gate = gate(&store, &kv);
        let user = store.user(store.add_user(50));
        (store, kv, gate, user)
    }

    /// 진행 중 기록의 시작 시각을 과거로 옮김
    async fn rewind_start(kv: &MemoryStore, user: &User, secs: i64) {
        let key = in_progress_key(&user.email);
        let mut record: InProgressQuiz =
            serde_json::from_str(&kv.get(&key).await.unwrap().unwrap()).unwrap();
        record.start_time -= chrono::Duration::seconds(secs);
        assert!(kv.replace(&key, &serde_json::to_string(&record).unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_start_rejected_while_in_progress() {
        let (_store, _kv, gate, user) = setup();

        let started = gate.start(&user, 3).await.unwrap();
        assert!(started.attempt_id > 0);
        assert_eq!(started.options.len(), 4);

        let err = gate.start(&user, 4).await.unwrap_err();
        assert!(matches!(err, ApiError::QuizInProgress));
    }

    #[tokio::test]
    async fn test_correct_answer_issues_passed_token() {
        let (store, kv, gate, user) = setup();
        gate.start(&user, 3).await.unwrap();

        // 퀴즈 1번 정답은 1
        let result = gate.submit(&user, 1).await.unwrap();
        assert!(result.is_correct);
        assert!(result.harvest_enabled);
        assert_eq!(result.status, AttemptStatus::Done);
        assert!(result.harvest_timeout_at.is_some());

        assert!(kv.get(&passed_key(3, &user.email)).await.unwrap().is_some());
        assert!(kv.get(&in_progress_key(&user.email)).await.unwrap().is_none());

        let attempt = store.state.read().unwrap().attempts.values().next().cloned().unwrap();
        assert_eq!(attempt.harvest_status, HarvestStatus::InProgress);
        assert_eq!(attempt.selected_option, Some(1));
    }

    #[tokio::test]
    async fn test_wrong_answer_has_no_token() {
        let (_store, kv, gate, user) = setup();
        gate.start(&user, 2).await.unwrap();

        let result = gate.submit(&user, 3).await.unwrap();
        assert!(!result.is_correct);
        assert!(!result.harvest_enabled);
        assert_eq!(result.correct_option, 1);
        assert!(kv.get(&passed_key(2, &user.email)).await.unwrap().is_none());

        // 제출 후에는 새로 시작 가능
        assert!(gate.start(&user, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_late_correct_answer_is_timeout() {
        let (store, kv, gate, user) = setup();
        gate.start(&user, 2).await.unwrap();
        rewind_start(&kv, &user, 31).await;

        let result = gate.submit(&user, 1).await.unwrap();
        assert_eq!(result.status, AttemptStatus::Timeout);
        assert!(!result.harvest_enabled);
        assert!(kv.get(&passed_key(2, &user.email)).await.unwrap().is_none());

        let attempt = store.state.read().unwrap().attempts.values().next().cloned().unwrap();
        assert_eq!(attempt.status, AttemptStatus::Timeout);

        // 늦은 정답으로는 수확 불가
        let engine = HarvestEngine::new(store.clone(), store.clone(), kv.clone(), HarvestRules::default());
        let err = engine.harvest(&user, 2, Some(attempt.id)).await.unwrap_err();
        assert!(matches!(err, ApiError::NoQuizPassed));

        assert!(store.position(2).is_available);
        assert_eq!(store.user(user.id).last_harvest_at, user.last_harvest_at);
        assert_eq!(store.user(user.id).lemon_balance, user.lemon_balance);
    }

    #[tokio::test]
    async fn test_submit_without_start() {
        let (_store, _kv, gate, user) = setup();
        let err = gate.submit(&user, 0).await.unwrap_err();
        assert!(matches!(err, ApiError::NoQuizInProgress));
    }

    #[tokio::test]
    async fn test_out_of_range_option_keeps_attempt() {
        let (_store, kv, gate, user) = setup();
        gate.start(&user, 1).await.unwrap();

        assert!(gate.submit(&user, 9).await.is_err());
        assert!(kv.get(&in_progress_key(&user.email)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_start_on_harvested_position() {
        let (store, _kv, gate, user) = setup();
        store.state.write().unwrap().positions.get_mut(&5).unwrap().is_available = false;

        let err = gate.start(&user, 5).await.unwrap_err();
        assert!(matches!(err, ApiError::AlreadyHarvested));
        assert!(matches!(
            gate.start(&user, 10).await.unwrap_err(),
            ApiError::InvalidParameter { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_blocked_by_user_cooldown() {
        let (store, _kv, gate, _user) = setup();
        let id = store.add_user(50);
        store.set_last_harvest(id, Some(Utc::now() - chrono::Duration::minutes(30)));
        let user = store.user(id);

        let err = gate.start(&user, 0).await.unwrap_err();
        match err {
            ApiError::HarvestCooldown { wait_seconds } => assert!(wait_seconds > 29 * 60),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

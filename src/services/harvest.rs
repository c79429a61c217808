//! Harvest Engine
//!
//! 10개 위치의 레몬 나무와 사용자 수확
//!
//! # Interview Q&A
//!
//! Q: 같은 레몬을 두 사람이 동시에 수확하면?
//! A: `claim_harvest` 트랜잭션 안에서 위치 row 를 FOR UPDATE 로 잡음
//!    - 먼저 잡은 쪽만 available → cooling 전이에 성공
//!    - 진 쪽은 `AlreadyHarvested`, 잔액 변화 없음, 통과 기록은 소비되지 않음
//!
//! Q: 통과 기록은 언제 소비하는가?
//! A: 수확 트랜잭션이 커밋된 뒤
//!    - 검사 시점에는 GET 으로만 확인
//!    - 실패한 수확은 기록을 남겨 창 안에서 재시도 가능
//!
//! Q: 재생성은 누가 하는가?
//! A: 주기 스케줄러가 `regrow` 호출 → 시간이 지난 위치를 available 로 되돌리고 새 퀴즈 배정
//!    - 같은 시각으로 두 번 호출해도 두 번째는 아무것도 하지 않음

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{HarvestClaim, LemonStore, QuizStore};
use crate::error::{ApiError, ApiResult};
use crate::kv::KvStore;
use crate::types::{
    passed_key, HarvestEligibility, HarvestOutcome, HarvestRules, HarvestStatus, QuizAttempt,
    TreeStatus, User,
};

pub struct HarvestEngine {
    lemons: Arc<dyn LemonStore>,
    quizzes: Arc<dyn QuizStore>,
    kv: Arc<dyn KvStore>,
    rules: HarvestRules,
}

impl HarvestEngine {
    pub fn new(
        lemons: Arc<dyn LemonStore>,
        quizzes: Arc<dyn QuizStore>,
        kv: Arc<dyn KvStore>,
        rules: HarvestRules,
    ) -> Self {
        Self {
            lemons,
            quizzes,
            kv,
            rules,
        }
    }

    pub fn rules(&self) -> &HarvestRules {
        &self.rules
    }

    /// 퀴즈를 통과한 위치의 레몬 수확
    ///
    /// `attempt_id` 가 있으면 해당 시도의 harvest_status 도 갱신
    pub async fn harvest(
        &self,
        user: &User,
        position_id: i32,
        attempt_id: Option<i64>,
    ) -> ApiResult<HarvestOutcome> {
        if !self.rules.is_valid_position(position_id) {
            return Err(ApiError::invalid_param("positionID", "must be between 0 and 9"));
        }

        let attempt = match attempt_id {
            Some(id) => Some(self.find_attempt(user, id, position_id).await?),
            None => None,
        };

        if let Some(a) = &attempt {
            if a.harvest_status == HarvestStatus::Success {
                return Err(ApiError::HarvestAlreadyProcessed);
            }
        }

        let key = passed_key(position_id, &user.email);
        if self.kv.get(&key).await?.is_none() {
            return Err(match &attempt {
                Some(a) if a.harvest_status == HarvestStatus::InProgress => {
                    self.mark(a.id, HarvestStatus::Timeout).await;
                    ApiError::ClickTimeExpired
                }
                _ => ApiError::NoQuizPassed,
            });
        }

        let claim = HarvestClaim {
            user_id: user.id,
            position_id,
            rules: self.rules,
            now: Utc::now(),
        };

        match self.lemons.claim_harvest(&claim).await {
            Ok(outcome) => {
                // 커밋 후 소비
                if let Err(e) = self.kv.del(&key).await {
                    tracing::warn!(error = %e, position = position_id, "failed to consume passed token");
                }
                if let Some(a) = &attempt {
                    self.mark(a.id, HarvestStatus::Success).await;
                }
                tracing::info!(
                    user_id = %user.id,
                    position = position_id,
                    amount = outcome.harvested_amount,
                    balance = outcome.new_balance,
                    "lemon harvested"
                );
                Ok(outcome)
            }
            Err(e) => {
                if let Some(a) = &attempt {
                    if !e.is_internal() {
                        self.mark(a.id, HarvestStatus::Failure).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn find_attempt(&self, user: &User, attempt_id: i64, position_id: i32) -> ApiResult<QuizAttempt> {
        let attempt = self
            .quizzes
            .find_attempt(user.id, attempt_id)
            .await?
            .ok_or_else(|| ApiError::not_found("attempt", attempt_id))?;

        if attempt.position_id != position_id {
            return Err(ApiError::invalid_param("attemptID", "attempt belongs to another position"));
        }
        Ok(attempt)
    }

    /// 통계용 상태 기록 (실패해도 수확 결과에는 영향 없음)
    async fn mark(&self, attempt_id: i64, status: HarvestStatus) {
        if let Err(e) = self.quizzes.set_harvest_status(attempt_id, status, Utc::now()).await {
            tracing::warn!(error = %e, attempt_id, status = status.as_str(), "failed to record harvest status");
        }
    }

    pub async fn tree_status(&self) -> ApiResult<TreeStatus> {
        let (available_positions, next_regrowth_time) = self.lemons.tree_snapshot().await?;
        let total_harvested = self.lemons.total_harvested().await?;

        Ok(TreeStatus {
            available_positions,
            total_harvested,
            next_regrowth_time,
        })
    }

    pub fn can_harvest(&self, user: &User) -> HarvestEligibility {
        match self.rules.cooldown_remaining(user.last_harvest_at, Utc::now()) {
            Some(wait) => HarvestEligibility {
                can_harvest: false,
                wait_time: wait.num_seconds().max(1),
            },
            None => HarvestEligibility {
                can_harvest: true,
                wait_time: 0,
            },
        }
    }

    /// 재생성 시간이 지난 위치 복구 + 퀴즈 배정
    pub async fn regrow(&self, now: DateTime<Utc>) -> ApiResult<Vec<i32>> {
        let regrown = self.lemons.regrow(now).await?;
        if !regrown.is_empty() {
            let assigned = self.lemons.assign_quizzes().await?;
            tracing::info!(positions = ?regrown, assigned, "lemons regrown");
        }
        Ok(regrown)
    }

    /// 시작 시 퀴즈가 비어 있는 위치 채우기
    pub async fn init_tree(&self) -> ApiResult<()> {
        let assigned = self.lemons.assign_quizzes().await?;
        tracing::info!(assigned, "lemon tree initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::db::mock::MockStore;
    use crate::kv::MemoryStore;
    use crate::services::QuizGate;
    use crate::types::{ActionType, TxStatus};

    struct Fixture {
        store: Arc<MockStore>,
        kv: Arc<MemoryStore>,
        engine: HarvestEngine,
        gate: QuizGate,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MockStore::new());
        let kv = Arc::new(MemoryStore::new());
        let rules = HarvestRules::default();
        Fixture {
            engine: HarvestEngine::new(store.clone(), store.clone(), kv.clone(), rules),
            gate: QuizGate::new(store.clone(), store.clone(), kv.clone(), rules, Duration::from_secs(5)),
            store,
            kv,
        }
    }

    async fn pass_token(kv: &MemoryStore, position: i32, user: &User) {
        kv.set(&passed_key(position, &user.email), "passed", Duration::from_secs(5))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_quiz_then_harvest() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(50));

        let started = f.gate.start(&user, 3).await.unwrap();
        let answer = f.gate.submit(&user, 1).await.unwrap();
        assert!(answer.harvest_enabled);

        let before = Utc::now();
        let outcome = f.engine.harvest(&user, 3, Some(started.attempt_id)).await.unwrap();
        assert_eq!(outcome.harvested_amount, 5);
        assert_eq!(outcome.new_balance, 55);

        let entry = f.store.entries_for(user.id).pop().unwrap();
        assert_eq!(entry.action, ActionType::Harvest);
        assert_eq!(entry.amount, 5);
        assert_eq!(entry.status, TxStatus::Successful);

        let position = f.store.position(3);
        assert!(!position.is_available);
        let next = position.next_available_at.unwrap();
        assert!(next >= before + chrono::Duration::hours(1));
        assert!(next <= Utc::now() + chrono::Duration::hours(1));

        // 통과 기록 소비됨
        assert!(f.kv.get(&passed_key(3, &user.email)).await.unwrap().is_none());

        // 같은 시도로 재요청
        let user = f.store.user(user.id);
        let err = f.engine.harvest(&user, 3, Some(started.attempt_id)).await.unwrap_err();
        assert!(matches!(err, ApiError::HarvestAlreadyProcessed));

        // 다른 위치도 쿨다운
        let user = f.store.user(user.id);
        pass_token(&f.kv, 4, &user).await;
        match f.engine.harvest(&user, 4, None).await.unwrap_err() {
            ApiError::HarvestCooldown { wait_seconds } => {
                assert!(wait_seconds > 3590 && wait_seconds <= 3600)
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!f.engine.can_harvest(&user).can_harvest);
    }

    #[tokio::test]
    async fn test_harvest_clamped_then_storage_full() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(498));

        pass_token(&f.kv, 0, &user).await;
        let outcome = f.engine.harvest(&user, 0, None).await.unwrap();
        assert_eq!(outcome.harvested_amount, 2);
        assert_eq!(outcome.new_balance, 500);

        // 쿨다운이 지난 뒤
        f.store
            .set_last_harvest(user.id, Some(Utc::now() - chrono::Duration::hours(2)));
        let user = f.store.user(user.id);
        pass_token(&f.kv, 1, &user).await;

        let err = f.engine.harvest(&user, 1, None).await.unwrap_err();
        assert!(matches!(err, ApiError::StorageFull { max_lemons: 500 }));
        assert!(f.store.position(1).is_available);
        assert_eq!(f.store.user(user.id).lemon_balance, 500);
    }

    #[tokio::test]
    async fn test_concurrent_harvest_single_winner() {
        let f = fixture();
        let a = f.store.user(f.store.add_user(10));
        let b = f.store.user(f.store.add_user(10));
        pass_token(&f.kv, 7, &a).await;
        pass_token(&f.kv, 7, &b).await;

        let (ra, rb) = tokio::join!(f.engine.harvest(&a, 7, None), f.engine.harvest(&b, 7, None));

        let (winner, loser, loser_result) = match (&ra, &rb) {
            (Ok(_), Err(_)) => (&a, &b, rb),
            (Err(_), Ok(_)) => (&b, &a, ra),
            other => panic!("expected exactly one winner: {:?}", other),
        };
        assert!(matches!(loser_result, Err(ApiError::AlreadyHarvested)));
        assert_eq!(f.store.user(winner.id).lemon_balance, 15);
        assert_eq!(f.store.user(loser.id).lemon_balance, 10);

        // 진 쪽의 통과 기록은 남아 있음
        assert!(f.kv.get(&passed_key(7, &loser.email)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_harvest_without_passed_quiz() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(10));

        let err = f.engine.harvest(&user, 2, None).await.unwrap_err();
        assert!(matches!(err, ApiError::NoQuizPassed));
        assert_eq!(f.store.entries_for(user.id).len(), 1);
    }

    #[tokio::test]
    async fn test_passed_token_does_not_transfer_between_positions() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(10));
        pass_token(&f.kv, 2, &user).await;

        let err = f.engine.harvest(&user, 5, None).await.unwrap_err();
        assert!(matches!(err, ApiError::NoQuizPassed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_harvest_after_window_expired() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(10));

        let started = f.gate.start(&user, 6).await.unwrap();
        f.gate.submit(&user, 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        let err = f.engine.harvest(&user, 6, Some(started.attempt_id)).await.unwrap_err();
        assert!(matches!(err, ApiError::ClickTimeExpired));

        let attempt = f.store.state.read().unwrap().attempts[&started.attempt_id].clone();
        assert_eq!(attempt.harvest_status, HarvestStatus::Timeout);
        assert!(f.store.position(6).is_available);
    }

    #[tokio::test]
    async fn test_regrow_is_idempotent() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(10));
        pass_token(&f.kv, 4, &user).await;
        f.engine.harvest(&user, 4, None).await.unwrap();

        let status = f.engine.tree_status().await.unwrap();
        assert_eq!(status.available_positions.len(), 9);
        assert_eq!(status.total_harvested, 5);
        assert!(status.next_regrowth_time.is_some());

        // 아직 시간이 안 됨
        assert!(f.engine.regrow(Utc::now()).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::hours(1) + chrono::Duration::seconds(1);
        assert_eq!(f.engine.regrow(later).await.unwrap(), vec![4]);
        assert!(f.engine.regrow(later).await.unwrap().is_empty());

        let position = f.store.position(4);
        assert!(position.is_available);
        assert!(position.current_quiz_id.is_some());

        let status = f.engine.tree_status().await.unwrap();
        assert_eq!(status.available_positions.len(), 10);
        assert!(status.next_regrowth_time.is_none());
    }

    #[tokio::test]
    async fn test_can_harvest_fresh_user() {
        let f = fixture();
        let user = f.store.user(f.store.add_user(10));
        assert_eq!(
            f.engine.can_harvest(&user),
            HarvestEligibility { can_harvest: true, wait_time: 0 }
        );
    }
}

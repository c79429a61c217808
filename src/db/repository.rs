//! Repository Pattern Implementation
//!
//! # Interview Q&A
//!
//! Q: 왜 저장소를 trait 로 분리했는가?
//! A: 서비스 로직(원장, 수확, 생명주기)을 DB 없이 테스트하기 위해
//!
//!    ```rust,ignore
//!    // Service 레이어
//!    let entry = ledger_store.apply(&req).await?;
//!
//!    // PostgreSQL 구현: Database (db/ledger.rs 등)
//!    impl LedgerStore for Database { ... }
//!
//!    // 테스트용 Mock
//!    impl LedgerStore for MockStore { ... }
//!    ```
//!
//! Q: 트랜잭션 경계는 어디에 두는가?
//! A: 불변식을 지키는 단위 그대로 trait 메서드 하나 = DB 트랜잭션 하나
//!    - `LedgerStore::apply`: 사용자 row lock → 잔액 계산 → 원장 insert → 잔액 update
//!    - `LemonStore::claim_harvest`: 쿨다운 확인 + 위치 점유 + 원장 기록
//!    - 서비스는 트랜잭션을 직접 열지 않음

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::types::{
    AttemptStatus, BackupRecord, BackupStatus, DbInstance, HarvestOutcome, HarvestRules,
    HarvestStatus, InstanceStatus, LedgerEntry, LedgerRequest, Preset, Quiz, QuizAttempt, User,
};

/// 수확 요청 (한 트랜잭션으로 처리)
#[derive(Debug, Clone)]
pub struct HarvestClaim {
    pub user_id: Uuid,
    pub position_id: i32,
    pub rules: HarvestRules,
    pub now: DateTime<Utc>,
}

/// 유지비 청구 (차감 + 청구 시각 기록을 한 트랜잭션으로)
#[derive(Debug, Clone)]
pub struct BillingCharge {
    pub instance_id: i64,
    /// 읽은 시점의 `last_billed_at`. 달라졌으면 다른 tick 이 이미 청구한 것
    pub previous: Option<DateTime<Utc>>,
    pub billed_at: DateTime<Utc>,
    pub credit: f64,
    /// 선결제 잔여분으로 충당되면 None
    pub debit: Option<LedgerRequest>,
}

/// 잔액 원장
///
/// 잔액을 바꾸는 유일한 경로. 범위를 벗어나는 요청은 아무것도 기록하지 않고 실패
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// 잔액 변경 + 원장 기록 (원자적)
    ///
    /// - 음수가 되면 `InsufficientLemons`
    /// - 최대 보유량을 넘으면 `StorageFull`
    async fn apply(&self, req: &LedgerRequest) -> ApiResult<LedgerEntry>;

    /// 잔액 변화 없는 실패 기록
    async fn record_failed(&self, req: &LedgerRequest) -> ApiResult<LedgerEntry>;

    async fn balance(&self, user_id: Uuid) -> ApiResult<i64>;

    /// 최신순 (entries, total)
    async fn list_entries(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> ApiResult<(Vec<LedgerEntry>, i64)>;
}

/// 레몬 나무 (10개 위치)
#[async_trait]
pub trait LemonStore: Send + Sync {
    /// 사용자 쿨다운 확인 → 지급량 clamp → 위치 점유 → 원장 기록
    async fn claim_harvest(&self, claim: &HarvestClaim) -> ApiResult<HarvestOutcome>;

    /// 재생성 시간이 지난 위치를 available 로 되돌림 (되돌린 위치 반환)
    async fn regrow(&self, now: DateTime<Utc>) -> ApiResult<Vec<i32>>;

    /// 퀴즈가 없는 available 위치에 무작위 퀴즈 배정
    async fn assign_quizzes(&self) -> ApiResult<u64>;

    /// (available 위치, 가장 빠른 재생성 시각)
    async fn tree_snapshot(&self) -> ApiResult<(Vec<i32>, Option<DateTime<Utc>>)>;

    async fn total_harvested(&self) -> ApiResult<i64>;

    /// None = 존재하지 않는 위치
    async fn position_available(&self, position_id: i32) -> ApiResult<Option<bool>>;
}

/// 퀴즈 문항 + 시도 기록 (통계용 slow store)
#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn quiz_for_position(&self, position_id: i32) -> ApiResult<Option<Quiz>>;

    async fn quiz(&self, quiz_id: i64) -> ApiResult<Option<Quiz>>;

    async fn create_attempt(
        &self,
        user_id: Uuid,
        quiz_id: i64,
        position_id: i32,
        start_time: DateTime<Utc>,
    ) -> ApiResult<i64>;

    async fn find_attempt(&self, user_id: Uuid, attempt_id: i64) -> ApiResult<Option<QuizAttempt>>;

    async fn complete_attempt(
        &self,
        attempt_id: i64,
        selected_option: i32,
        is_correct: bool,
        status: AttemptStatus,
        submit_time: DateTime<Utc>,
        harvest_status: HarvestStatus,
    ) -> ApiResult<()>;

    async fn set_harvest_status(
        &self,
        attempt_id: i64,
        status: HarvestStatus,
        at: DateTime<Utc>,
    ) -> ApiResult<()>;
}

/// DB 인스턴스 선언 상태
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// 삭제되지 않은 인스턴스 수
    async fn count_active(&self, user_id: Uuid) -> ApiResult<i64>;

    async fn name_taken(&self, user_id: Uuid, name: &str) -> ApiResult<bool>;

    /// id/created_at 은 저장소가 채움. (user, name) 충돌 시 `InstanceNameConflict`
    ///
    /// 사용자 row 를 잠근 채 다시 세어 `max_active` 이상이면 `LimitExceeded`
    async fn insert_instance(&self, instance: &DbInstance, max_active: i64) -> ApiResult<DbInstance>;

    async fn find_instance(&self, user_id: Uuid, external_id: Uuid) -> ApiResult<Option<DbInstance>>;

    async fn list_instances(&self, user_id: Uuid) -> ApiResult<Vec<DbInstance>>;

    async fn list_by_status(&self, status: InstanceStatus) -> ApiResult<Vec<DbInstance>>;

    /// 낙관적 전이: 현재 상태가 `from` 일 때만 `to` 로 변경 (false = 경쟁에서 짐)
    ///
    /// paused 로 가면 paused_at 기록, paused 에서 running 으로 가면 해제
    async fn transition(
        &self,
        id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> ApiResult<bool>;

    /// provisioning 상태에서만 관측 상태 반영
    async fn apply_observed(
        &self,
        id: i64,
        status: InstanceStatus,
        reason: Option<&str>,
        endpoint: Option<&str>,
        port: Option<i32>,
    ) -> ApiResult<bool>;

    /// 원장 차감과 `last_billed_at`/`billing_credit` 갱신을 함께 커밋
    ///
    /// `previous` 가 맞지 않으면 아무것도 바꾸지 않고 false
    async fn record_charge(&self, charge: &BillingCharge) -> ApiResult<bool>;

    async fn soft_delete_instance(&self, id: i64, at: DateTime<Utc>) -> ApiResult<()>;
}

/// NodePort 할당 테이블
#[async_trait]
pub trait PortStore: Send + Sync {
    /// 가장 낮은 미사용 포트 할당 (없으면 `PortExhausted`)
    async fn allocate_port(&self, instance_id: Uuid) -> ApiResult<i32>;

    async fn release_port(&self, instance_id: Uuid) -> ApiResult<()>;
}

#[async_trait]
pub trait PresetStore: Send + Sync {
    async fn list_presets(&self) -> ApiResult<Vec<Preset>>;

    async fn find_preset(&self, id: &str) -> ApiResult<Option<Preset>>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    async fn insert_backup(&self, record: &BackupRecord) -> ApiResult<BackupRecord>;

    async fn list_backups(&self, instance_id: i64) -> ApiResult<Vec<BackupRecord>>;

    async fn find_backup(&self, instance_id: i64, external_id: Uuid) -> ApiResult<Option<BackupRecord>>;

    async fn update_backup(
        &self,
        id: i64,
        status: BackupStatus,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> ApiResult<()>;
}

/// 세션/사용자 (OTP 인증 협력자가 생성한 데이터 조회)
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_session(&self, token_hash: &str, now: DateTime<Utc>) -> ApiResult<Option<User>>;

    async fn find_user(&self, user_id: Uuid) -> ApiResult<Option<User>>;

    async fn delete_session(&self, token_hash: &str) -> ApiResult<()>;

    /// 이메일을 tombstone 으로 바꾸고 세션 제거
    async fn soft_delete_user(&self, user_id: Uuid, at: DateTime<Utc>) -> ApiResult<()>;

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> ApiResult<u64>;
}

/// 삭제된 사용자 이메일 (주소 재사용 허용)
pub fn tombstone_email(user_id: Uuid, at: DateTime<Utc>) -> String {
    format!("deleted+{}+{}@dbtree.invalid", user_id.simple(), at.timestamp())
}

// PostgreSQL 구현은 Database 구조체에 있음 (db/ledger.rs, db/lemon.rs, ...)
// 테스트용 Mock 구현:

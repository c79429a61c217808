//! Fast KV Store
//!
//! 퀴즈 진행/통과 기록처럼 짧게 살다 사라지는 상태 저장소
//!
//! # Interview Q&A
//!
//! Q: 왜 PostgreSQL 이 아니라 별도 KV 인가?
//! A: 퀴즈 상태는 뜨겁고, 크기가 작고, TTL 로 사라진다
//!    - RDB 에 두면 만료 정리용 sweeper 가 필요하고 row lock 시간을 잡아먹음
//!    - `SET NX EX` 로 "사용자당 진행 중 퀴즈 1개" 를 락 없이 보장
//!
//! Q: Redis 없이도 동작하는가?
//! A: `USE_LOCAL_MEMORY_STORE=true` 면 프로세스 내 `MemoryStore` 사용
//!    - 단일 인스턴스 개발/테스트용 (여러 서버 간 공유 안 됨)

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ApiResult;

#[async_trait]
pub trait KvStore: Send + Sync {
    /// 키가 없을 때만 저장 (true = 저장됨)
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ApiResult<bool>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> ApiResult<()>;

    /// 키가 있을 때만 값 교체, 남은 TTL 유지 (true = 교체됨)
    async fn replace(&self, key: &str, value: &str) -> ApiResult<bool>;

    async fn get(&self, key: &str) -> ApiResult<Option<String>>;

    /// 읽으면서 삭제 (한 번만 소비)
    async fn get_del(&self, key: &str) -> ApiResult<Option<String>>;

    async fn del(&self, key: &str) -> ApiResult<bool>;

    async fn ping(&self) -> ApiResult<()>;
}

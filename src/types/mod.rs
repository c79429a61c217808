//! Common Types Module
//!
//! 애플리케이션 전반에서 사용되는 도메인 타입 정의
//!
//! - `lemon`: 레몬 경제 (원장, 수확 규칙)
//! - `quiz`: 퀴즈 게이트 상태
//! - `instance`: DB 인스턴스 선언 상태, 상태 머신, 비용
//! - `engine`: 엔진별 설정 검증

pub mod engine;
pub mod instance;
pub mod lemon;
pub mod quiz;

use serde::{Deserialize, Serialize};

pub use engine::{EngineConfig, MongoConfig, PersistenceMode, RedisConfig};
pub use instance::*;
pub use lemon::*;
pub use quiz::*;

/// 페이지네이션 쿼리 파라미터
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PageQuery {
    /// 페이지 (0부터 시작)
    pub page: Option<u32>,
    /// 페이지 크기 (기본 20, 최대 100)
    pub limit: Option<u32>,
}

impl PageQuery {
    pub fn page(&self) -> u32 {
        self.page.unwrap_or(0)
    }

    pub fn limit(&self) -> u32 {
        self.limit.unwrap_or(20).clamp(1, 100)
    }

    pub fn offset(&self) -> i64 {
        self.page() as i64 * self.limit() as i64
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub has_next: bool,
}

impl Pagination {
    pub fn new(query: PageQuery, total: i64) -> Self {
        let total = total.max(0) as u64;
        Self {
            page: query.page(),
            limit: query.limit(),
            total,
            has_next: ((query.page() as u64 + 1) * query.limit() as u64) < total,
        }
    }
}

/// 사용자 (인증 협력자가 생성, 코어는 조회만)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: uuid::Uuid,
    pub email: String,
    pub lemon_balance: i64,
    pub last_harvest_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_limits() {
        let q = PageQuery { page: Some(2), limit: Some(500) };
        assert_eq!(q.limit(), 100);
        assert_eq!(q.offset(), 200);

        let p = Pagination::new(PageQuery { page: Some(0), limit: Some(20) }, 21);
        assert!(p.has_next);
        let p = Pagination::new(PageQuery { page: Some(1), limit: Some(20) }, 21);
        assert!(!p.has_next);
    }
}

//! dBtree Control Plane Library
//!
//! # Overview
//!
//! 레몬(가상 화폐)으로 MongoDB / Redis 인스턴스를 빌려 쓰는 managed DB 컨트롤 플레인.
//! 레몬은 퀴즈를 풀고 나무에서 수확해 모으고, 인스턴스 생성과 시간당 유지비로 소비한다.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                             API                               │
//! │                                                               │
//! │  ┌────────┐   ┌──────────────────────────────────────────┐   │
//! │  │ Routes │──▶│ Services                                  │   │
//! │  └────────┘   │  QuizGate → HarvestEngine → Ledger        │   │
//! │               │  InstanceLifecycle (create/billing) ──┐   │   │
//! │               └───────────┬───────────────────────────┼───┘   │
//! │                           │                           │       │
//! │                  ┌────────▼───────┐          ┌────────▼────┐  │
//! │                  │ PostgreSQL / KV│          │ DBInstance  │  │
//! │                  └────────────────┘          │  (CRD)      │  │
//! │                                              └────────┬────┘  │
//! └───────────────────────────────────────────────────────┼───────┘
//!                                                         ▼
//!                                               ┌──────────────────┐
//!                                               │    Reconciler    │
//!                                               │ StatefulSet/Svc/ │
//!                                               │ Secret/CronJob   │
//!                                               └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - `config`: 환경 설정 관리
//! - `error`: 에러 타입, 코드 체계, HTTP 응답
//! - `routes`: HTTP 엔드포인트 핸들러
//! - `services`: 비즈니스 로직 (원장, 수확, 퀴즈, 인스턴스 생명주기)
//! - `db`: PostgreSQL 저장소와 마이그레이션
//! - `kv`: 퀴즈 상태용 KV (Redis / 인메모리)
//! - `k8s`: DBInstance 커스텀 리소스와 클러스터 클라이언트
//! - `reconciler`: DBInstance → 워크로드 수렴 컨트롤러
//! - `types`: 공통 타입 정의

use std::sync::Arc;

pub mod config;
pub mod db;
pub mod error;
pub mod k8s;
pub mod kv;
pub mod reconciler;
pub mod routes;
pub mod services;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use db::Database;
pub use error::ApiError;
pub use services::{HarvestEngine, InstanceLifecycle, Ledger, QuizGate};

/// 애플리케이션 전역 상태
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: Arc<Database>,
    pub kv: Arc<dyn kv::KvStore>,
    pub users: Arc<dyn db::UserStore>,
    pub ledger: Ledger,
    pub harvest: Arc<HarvestEngine>,
    pub quiz: Arc<QuizGate>,
    pub lifecycle: Arc<InstanceLifecycle>,
}

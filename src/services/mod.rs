//! Services Module
//!
//! 비즈니스 로직을 담당하는 서비스 레이어
//!
//! # Services
//! - `Ledger`: 레몬 잔액을 바꾸는 유일한 경로 (원장 + 잔액 원자적 갱신)
//! - `HarvestEngine`: 10개 위치의 레몬 나무, 수확과 재생성
//! - `QuizGate`: 퀴즈 진행/통과 상태 (KV + TTL)
//! - `InstanceLifecycle`: DB 인스턴스 생성/삭제/제어, 백업, 과금
//! - `Scheduler`: 재생성/과금/세션 정리 주기 실행

mod billing;
mod harvest;
mod ledger;
mod lifecycle;
mod quiz;
pub mod scheduler;

pub use billing::{BillingReport, BILLING_PERIOD_MINUTES, PAUSED_EXPIRY_MINUTES};
pub use harvest::HarvestEngine;
pub use ledger::{Ledger, TransactionPage};
pub use lifecycle::InstanceLifecycle;
pub use quiz::QuizGate;
pub use scheduler::{BillingSweep, RegrowthSweep, Scheduler, SessionCleanupSweep, Sweep};

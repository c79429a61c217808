//! Ledger Service
//!
//! # Interview Q&A
//!
//! Q: 잔액 불변식은 어떻게 보장하는가?
//! A: "User.lemon_balance = 성공한 원장 delta 의 합"
//!    - 잔액 변경과 원장 insert 가 같은 DB 트랜잭션
//!    - 사용자 row lock 으로 같은 사용자의 변경은 직렬화
//!    - 범위(0..=500) 밖이면 아무것도 기록하지 않고 실패
//!
//! Q: 차감/지급 부호 규칙은?
//! A: 차감은 음수, 지급은 양수로 저장. 호출자는 항상 양수 금액을 넘김

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::db::LedgerStore;
use crate::error::{ApiError, ApiResult};
use crate::types::{ActionType, LedgerEntry, LedgerRequest, PageQuery, Pagination, WELCOME_BONUS};

/// 원장 목록 응답
#[derive(Debug, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<LedgerEntry>,
    pub pagination: Pagination,
}

/// 잔액을 바꾸는 유일한 서비스
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn credit(
        &self,
        user_id: Uuid,
        amount: i64,
        action: ActionType,
        note: Option<String>,
    ) -> ApiResult<LedgerEntry> {
        self.credit_for(user_id, None, amount, action, note).await
    }

    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        action: ActionType,
        note: Option<String>,
    ) -> ApiResult<LedgerEntry> {
        self.debit_for(user_id, None, amount, action, note).await
    }

    /// 인스턴스 참조가 붙는 지급 (환불 등)
    pub async fn credit_for(
        &self,
        user_id: Uuid,
        instance_id: Option<Uuid>,
        amount: i64,
        action: ActionType,
        note: Option<String>,
    ) -> ApiResult<LedgerEntry> {
        ensure_positive(amount)?;
        let entry = self
            .store
            .apply(&LedgerRequest {
                user_id,
                delta: amount,
                action,
                note,
                instance_id,
            })
            .await?;

        tracing::debug!(%user_id, amount, action = %action, balance = entry.balance, "lemons credited");
        Ok(entry)
    }

    /// 인스턴스 참조가 붙는 차감 (생성, 유지비)
    pub async fn debit_for(
        &self,
        user_id: Uuid,
        instance_id: Option<Uuid>,
        amount: i64,
        action: ActionType,
        note: Option<String>,
    ) -> ApiResult<LedgerEntry> {
        ensure_positive(amount)?;
        let entry = self
            .store
            .apply(&LedgerRequest {
                user_id,
                delta: -amount,
                action,
                note,
                instance_id,
            })
            .await?;

        tracing::debug!(%user_id, amount, action = %action, balance = entry.balance, "lemons debited");
        Ok(entry)
    }

    /// 외부 시스템이 거절한 작업 기록 (잔액 변화 없음)
    pub async fn record_failed(
        &self,
        user_id: Uuid,
        instance_id: Option<Uuid>,
        delta: i64,
        action: ActionType,
        note: Option<String>,
    ) -> ApiResult<LedgerEntry> {
        self.store
            .record_failed(&LedgerRequest {
                user_id,
                delta,
                action,
                note,
                instance_id,
            })
            .await
    }

    pub async fn balance(&self, user_id: Uuid) -> ApiResult<i64> {
        self.store.balance(user_id).await
    }

    pub async fn list_transactions(&self, user_id: Uuid, page: PageQuery) -> ApiResult<TransactionPage> {
        let (transactions, total) = self
            .store
            .list_entries(user_id, page.limit() as i64, page.offset())
            .await?;

        Ok(TransactionPage {
            transactions,
            pagination: Pagination::new(page, total),
        })
    }

    /// 회원가입 보너스 (사용자 생성 협력자가 호출)
    pub async fn grant_welcome_bonus(&self, user_id: Uuid) -> ApiResult<LedgerEntry> {
        self.credit(user_id, WELCOME_BONUS, ActionType::WelcomeBonus, Some("welcome".into()))
            .await
    }
}

fn ensure_positive(amount: i64) -> ApiResult<()> {
    if amount <= 0 {
        return Err(ApiError::invalid_param("amount", "must be positive"));
    }
    Ok(())
}

//! Lemon economy types
//!
//! 레몬 = 정수 단위 가상 화폐. 잔액은 항상 0 ≤ balance ≤ MAX_STORED_LEMONS

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 한 번 수확 시 기본 지급량
pub const BASE_AMOUNT: i64 = 5;
/// 사용자당 최대 보유 레몬
pub const MAX_STORED_LEMONS: i64 = 500;
/// 회원가입 보너스
pub const WELCOME_BONUS: i64 = 50;
/// 나무의 레몬 위치 수 (0..=9)
pub const MAX_POSITIONS: i32 = 10;

/// 수확 규칙
#[derive(Debug, Clone, Copy)]
pub struct HarvestRules {
    pub base_amount: i64,
    pub max_stored_lemons: i64,
    /// 위치 재생성 + 사용자 재수확 대기 시간
    pub cooldown: Duration,
    pub max_positions: i32,
}

impl Default for HarvestRules {
    fn default() -> Self {
        Self {
            base_amount: BASE_AMOUNT,
            max_stored_lemons: MAX_STORED_LEMONS,
            cooldown: Duration::hours(1),
            max_positions: MAX_POSITIONS,
        }
    }
}

impl HarvestRules {
    /// 보유 한도를 넘지 않도록 지급량 조정 (0 이면 창고 가득)
    pub fn clamp_amount(&self, balance: i64) -> i64 {
        (self.max_stored_lemons - balance).clamp(0, self.base_amount)
    }

    /// 사용자 쿨다운 남은 시간 (None = 수확 가능)
    pub fn cooldown_remaining(
        &self,
        last_harvest_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        let next = last_harvest_at? + self.cooldown;
        (next > now).then(|| next - now)
    }

    pub fn is_valid_position(&self, position: i32) -> bool {
        (0..self.max_positions).contains(&position)
    }
}

/// 잔액에 영향을 주는 모든 활동
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    WelcomeBonus,
    Harvest,
    InstanceCreate,
    InstanceCreateRefund,
    InstanceMaintain,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::WelcomeBonus => "welcome_bonus",
            ActionType::Harvest => "harvest",
            ActionType::InstanceCreate => "instance_create",
            ActionType::InstanceCreateRefund => "instance_create_refund",
            ActionType::InstanceMaintain => "instance_maintain",
        }
    }

    /// 차감(음수 delta) 액션 여부
    pub fn is_debit(&self) -> bool {
        matches!(self, ActionType::InstanceCreate | ActionType::InstanceMaintain)
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "welcome_bonus" => Ok(ActionType::WelcomeBonus),
            "harvest" => Ok(ActionType::Harvest),
            "instance_create" => Ok(ActionType::InstanceCreate),
            "instance_create_refund" => Ok(ActionType::InstanceCreateRefund),
            "instance_maintain" => Ok(ActionType::InstanceMaintain),
            other => Err(format!("unknown action type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Successful,
    Failed,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Successful => "successful",
            TxStatus::Failed => "failed",
        }
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "successful" => Ok(TxStatus::Successful),
            "failed" => Ok(TxStatus::Failed),
            other => Err(format!("unknown transaction status: {}", other)),
        }
    }
}

/// 원장 기록 (append-only)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: Uuid,
    pub instance_id: Option<Uuid>,
    pub action: ActionType,
    pub status: TxStatus,
    /// 차감은 음수, 지급은 양수
    pub amount: i64,
    /// 기록 직후 잔액
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub note: Option<String>,
}

/// 원장 기록 요청
#[derive(Debug, Clone)]
pub struct LedgerRequest {
    pub user_id: Uuid,
    /// 부호 포함 금액
    pub delta: i64,
    pub action: ActionType,
    pub note: Option<String>,
    pub instance_id: Option<Uuid>,
}

/// 나무 전체 상태
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeStatus {
    pub available_positions: Vec<i32>,
    pub total_harvested: i64,
    /// 모든 위치가 수확 가능하면 생략
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_regrowth_time: Option<DateTime<Utc>>,
}

/// 사용자 수확 가능 여부
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestEligibility {
    pub can_harvest: bool,
    /// 남은 대기 시간 (초)
    pub wait_time: i64,
}

/// 수확 트랜잭션 결과
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HarvestOutcome {
    pub position_id: i32,
    pub harvested_amount: i64,
    pub new_balance: i64,
    pub transaction_id: i64,
    pub next_available_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_amount() {
        let rules = HarvestRules::default();
        assert_eq!(rules.clamp_amount(50), 5);
        assert_eq!(rules.clamp_amount(498), 2);
        assert_eq!(rules.clamp_amount(500), 0);
    }

    #[test]
    fn test_cooldown_remaining() {
        let rules = HarvestRules::default();
        let now = Utc::now();
        assert!(rules.cooldown_remaining(None, now).is_none());

        let remaining = rules
            .cooldown_remaining(Some(now - Duration::minutes(10)), now)
            .unwrap();
        assert_eq!(remaining.num_minutes(), 50);

        assert!(rules
            .cooldown_remaining(Some(now - Duration::hours(2)), now)
            .is_none());
    }

    #[test]
    fn test_debit_actions() {
        assert!(ActionType::InstanceCreate.is_debit());
        assert!(ActionType::InstanceMaintain.is_debit());
        assert!(!ActionType::InstanceCreateRefund.is_debit());
        assert!(!ActionType::Harvest.is_debit());
    }
}

//! Quiz gate types

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// in-progress 기록 TTL 여유 시간 (네트워크 지연 보정)
pub const TIME_BUFFER_SECS: u64 = 3;

pub fn in_progress_key(email: &str) -> String {
    format!("quiz:in_progress:{}", email)
}

pub fn passed_key(position_id: i32, email: &str) -> String {
    format!("quiz:passed:{}:{}", position_id, email)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Basics,
    Sql,
    Design,
}

/// 퀴즈 문항
#[derive(Debug, Clone)]
pub struct Quiz {
    pub id: i64,
    pub question: String,
    pub options: Vec<String>,
    pub correct_option_idx: i32,
    pub difficulty: Difficulty,
    pub category: Category,
    pub explanation: String,
    /// 제한 시간 (초)
    pub time_limit: i32,
}

/// 진행 중 퀴즈 (fast KV 저장)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressQuiz {
    pub quiz_id: i64,
    pub position_id: i32,
    pub start_time: DateTime<Utc>,
    /// 0 = 아직 attempt row 생성 전
    pub attempt_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Done,
    Timeout,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Started => "started",
            AttemptStatus::Done => "done",
            AttemptStatus::Timeout => "timeout",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(AttemptStatus::Started),
            "done" => Ok(AttemptStatus::Done),
            "timeout" => Ok(AttemptStatus::Timeout),
            other => Err(format!("unknown attempt status: {}", other)),
        }
    }
}

/// 퀴즈 통과 후 수확 처리 상태 (통계용)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestStatus {
    None,
    InProgress,
    Success,
    Timeout,
    Failure,
}

impl HarvestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStatus::None => "none",
            HarvestStatus::InProgress => "in_progress",
            HarvestStatus::Success => "success",
            HarvestStatus::Timeout => "timeout",
            HarvestStatus::Failure => "failure",
        }
    }
}

impl FromStr for HarvestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(HarvestStatus::None),
            "in_progress" => Ok(HarvestStatus::InProgress),
            "success" => Ok(HarvestStatus::Success),
            "timeout" => Ok(HarvestStatus::Timeout),
            "failure" => Ok(HarvestStatus::Failure),
            other => Err(format!("unknown harvest status: {}", other)),
        }
    }
}

/// 퀴즈 시도 기록 (통계용 slow store)
#[derive(Debug, Clone)]
pub struct QuizAttempt {
    pub id: i64,
    pub user_id: uuid::Uuid,
    pub quiz_id: i64,
    pub position_id: i32,
    pub start_time: DateTime<Utc>,
    pub submit_time: Option<DateTime<Utc>>,
    pub selected_option: Option<i32>,
    pub is_correct: bool,
    pub status: AttemptStatus,
    pub harvest_status: HarvestStatus,
}

/// GET /quiz/:positionID 응답
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizStartResponse {
    pub attempt_id: i64,
    pub position_id: i32,
    pub question: String,
    pub options: Vec<String>,
    pub time_limit: i32,
    pub start_time: DateTime<Utc>,
}

/// POST /quiz/answer 응답
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerResponse {
    pub is_correct: bool,
    pub correct_option: i32,
    pub explanation: String,
    pub status: AttemptStatus,
    pub harvest_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harvest_timeout_at: Option<DateTime<Utc>>,
}

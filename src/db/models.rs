//! Database Models
//!
//! Row types read with `sqlx::FromRow` and their conversion into domain types.
//! Enum-like columns are stored as TEXT and parsed on the way out.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ApiError;
use crate::types::{
    BackupConfig, BackupRecord, BackupType, Category, DbInstance, Difficulty, LedgerEntry,
    LemonCost, Preset, Quiz, QuizAttempt, ResourceSpec, User,
};

/// 사용자
#[derive(Debug, Clone, FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub email: String,
    pub lemon_balance: i64,
    pub last_harvest_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            email: row.email,
            lemon_balance: row.lemon_balance,
            last_harvest_at: row.last_harvest_at,
            created_at: row.created_at,
        }
    }
}

/// 원장 기록
#[derive(Debug, Clone, FromRow)]
pub struct LedgerRow {
    pub id: i64,
    pub user_id: Uuid,
    pub db_instance_id: Option<Uuid>,
    pub action_type: String,
    pub status: String,
    pub amount: i64,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub note: Option<String>,
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = ApiError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        Ok(LedgerEntry {
            id: row.id,
            user_id: row.user_id,
            instance_id: row.db_instance_id,
            action: row.action_type.parse().map_err(corrupt)?,
            status: row.status.parse().map_err(corrupt)?,
            amount: row.amount,
            balance: row.balance,
            created_at: row.created_at,
            note: row.note,
        })
    }
}

/// 퀴즈
#[derive(Debug, Clone, FromRow)]
pub struct QuizRow {
    pub id: i64,
    pub question: String,
    pub options: Json<Vec<String>>,
    pub correct_option_idx: i32,
    pub difficulty: String,
    pub category: String,
    pub explanation: String,
    pub time_limit: i32,
}

impl TryFrom<QuizRow> for Quiz {
    type Error = ApiError;

    fn try_from(row: QuizRow) -> Result<Self, Self::Error> {
        let difficulty = match row.difficulty.as_str() {
            "easy" => Difficulty::Easy,
            "normal" => Difficulty::Normal,
            other => return Err(corrupt(format!("unknown difficulty {}", other))),
        };
        let category = match row.category.as_str() {
            "basics" => Category::Basics,
            "sql" => Category::Sql,
            "design" => Category::Design,
            other => return Err(corrupt(format!("unknown category {}", other))),
        };
        Ok(Quiz {
            id: row.id,
            question: row.question,
            options: row.options.0,
            correct_option_idx: row.correct_option_idx,
            difficulty,
            category,
            explanation: row.explanation,
            time_limit: row.time_limit,
        })
    }
}

/// 퀴즈 시도
#[derive(Debug, Clone, FromRow)]
pub struct AttemptRow {
    pub id: i64,
    pub user_id: Uuid,
    pub quiz_id: i64,
    pub position_id: i32,
    pub start_time: DateTime<Utc>,
    pub submit_time: Option<DateTime<Utc>>,
    pub selected_option: Option<i32>,
    pub is_correct: bool,
    pub status: String,
    pub harvest_status: String,
}

impl TryFrom<AttemptRow> for QuizAttempt {
    type Error = ApiError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(QuizAttempt {
            id: row.id,
            user_id: row.user_id,
            quiz_id: row.quiz_id,
            position_id: row.position_id,
            start_time: row.start_time,
            submit_time: row.submit_time,
            selected_option: row.selected_option,
            is_correct: row.is_correct,
            status: row.status.parse().map_err(corrupt)?,
            harvest_status: row.harvest_status.parse().map_err(corrupt)?,
        })
    }
}

/// DB 인스턴스
#[derive(Debug, Clone, FromRow)]
pub struct InstanceRow {
    pub id: i64,
    pub external_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    pub db_type: String,
    pub size: String,
    pub mode: String,
    pub created_from_preset: Option<String>,
    pub cpu: i32,
    pub memory: i32,
    pub disk: i32,
    pub creation_cost: i64,
    pub hourly_cost: f64,
    pub minimum_lemons: f64,
    pub status: String,
    pub status_reason: Option<String>,
    pub k8s_namespace: Option<String>,
    pub k8s_resource_name: Option<String>,
    pub endpoint: Option<String>,
    pub port: Option<i32>,
    pub external_port: Option<i32>,
    pub config: Json<Map<String, Value>>,
    pub backup_enabled: bool,
    pub backup_schedule: Option<String>,
    pub backup_retention_days: Option<i32>,
    pub backup_storage_size: Option<String>,
    pub billing_credit: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<InstanceRow> for DbInstance {
    type Error = ApiError;

    fn try_from(row: InstanceRow) -> Result<Self, Self::Error> {
        Ok(DbInstance {
            id: row.id,
            external_id: row.external_id,
            user_id: row.user_id,
            name: row.name,
            db_type: row.db_type.parse().map_err(corrupt)?,
            size: row.size.parse().map_err(corrupt)?,
            mode: row.mode.parse().map_err(corrupt)?,
            created_from_preset: row.created_from_preset,
            resources: ResourceSpec {
                cpu: row.cpu,
                memory: row.memory,
                disk: row.disk,
            },
            cost: LemonCost {
                creation_cost: row.creation_cost,
                hourly_lemons: row.hourly_cost,
                minimum_lemons: row.minimum_lemons,
            },
            status: row.status.parse().map_err(corrupt)?,
            status_reason: row.status_reason,
            k8s_namespace: row.k8s_namespace,
            k8s_resource_name: row.k8s_resource_name,
            endpoint: row.endpoint,
            port: row.port,
            external_port: row.external_port,
            config: row.config.0,
            backup: BackupConfig {
                enabled: row.backup_enabled,
                schedule: row.backup_schedule,
                retention_days: row.backup_retention_days,
                storage_size: row.backup_storage_size,
            },
            billing_credit: row.billing_credit,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_billed_at: row.last_billed_at,
            paused_at: row.paused_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// 프리셋
#[derive(Debug, Clone, FromRow)]
pub struct PresetRow {
    pub id: String,
    #[sqlx(rename = "type")]
    pub db_type: String,
    pub size: String,
    pub mode: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub use_cases: Json<Vec<String>>,
    pub cpu: i32,
    pub memory: i32,
    pub disk: i32,
    pub creation_cost: i64,
    pub hourly_cost: f64,
    pub minimum_lemons: f64,
    pub default_config: Json<Map<String, Value>>,
    pub sort_order: i32,
    pub available: bool,
}

impl TryFrom<PresetRow> for Preset {
    type Error = ApiError;

    fn try_from(row: PresetRow) -> Result<Self, Self::Error> {
        Ok(Preset {
            id: row.id,
            db_type: row.db_type.parse().map_err(corrupt)?,
            size: row.size.parse().map_err(corrupt)?,
            mode: row.mode.parse().map_err(corrupt)?,
            name: row.name,
            icon: row.icon,
            description: row.description,
            use_cases: row.use_cases.0,
            resources: ResourceSpec {
                cpu: row.cpu,
                memory: row.memory,
                disk: row.disk,
            },
            cost: LemonCost {
                creation_cost: row.creation_cost,
                hourly_lemons: row.hourly_cost,
                minimum_lemons: row.minimum_lemons,
            },
            default_config: row.default_config.0,
            sort_order: row.sort_order,
            available: row.available,
        })
    }
}

/// 백업 기록
#[derive(Debug, Clone, FromRow)]
pub struct BackupRow {
    pub id: i64,
    pub instance_id: i64,
    pub external_id: Uuid,
    pub name: String,
    #[sqlx(rename = "type")]
    pub backup_type: String,
    pub status: String,
    pub k8s_job_name: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl TryFrom<BackupRow> for BackupRecord {
    type Error = ApiError;

    fn try_from(row: BackupRow) -> Result<Self, Self::Error> {
        let backup_type = match row.backup_type.as_str() {
            "manual" => BackupType::Manual,
            "scheduled" => BackupType::Scheduled,
            other => return Err(corrupt(format!("unknown backup type {}", other))),
        };
        Ok(BackupRecord {
            id: row.id,
            instance_id: row.instance_id,
            external_id: row.external_id,
            name: row.name,
            backup_type,
            status: row.status.parse().map_err(corrupt)?,
            k8s_job_name: row.k8s_job_name,
            created_at: row.created_at,
            completed_at: row.completed_at,
            expires_at: row.expires_at,
            error_message: row.error_message,
        })
    }
}

/// 저장된 값이 도메인 enum 으로 해석되지 않음
#[track_caller]
fn corrupt(reason: impl Into<String>) -> ApiError {
    ApiError::internal(anyhow::anyhow!("corrupt row: {}", reason.into()))
}

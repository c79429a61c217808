//! Database instance domain types
//!
//! # State Machine
//!
//! ```text
//! provisioning ──► running ──► paused ──► running
//!      │              │  ├───► stopped ─► running
//!      ▼              │  ├───► maintenance ─► running
//!    error            │  └───► backing_up ──► running
//!      │              ▼
//!      └────────► deleting ◄── paused | stopped | error
//!
//! restoring ──► running | error
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ApiError;

/// 사용자당 최대 인스턴스 수 (삭제되지 않은 것 기준)
pub const MAX_INSTANCES_PER_USER: i64 = 2;

/// NodePort 할당 범위
pub const PORT_RANGE_START: i32 = 30000;
pub const PORT_RANGE_END: i32 = 31999;
/// 할당 시 건너뛰는 포트 (backend 등)
pub const RESERVED_PORTS: &[i32] = &[30080];

pub const MONGODB_PORT: i32 = 27017;
pub const REDIS_PORT: i32 = 6379;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbType {
    Mongodb,
    Redis,
}

impl DbType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbType::Mongodb => "mongodb",
            DbType::Redis => "redis",
        }
    }

    pub fn default_mode(&self) -> DbMode {
        match self {
            DbType::Mongodb => DbMode::Standalone,
            DbType::Redis => DbMode::Basic,
        }
    }

    pub fn default_port(&self) -> i32 {
        match self {
            DbType::Mongodb => MONGODB_PORT,
            DbType::Redis => REDIS_PORT,
        }
    }

    /// 접속 계정 이름
    pub fn username(&self) -> &'static str {
        match self {
            DbType::Mongodb => "admin",
            DbType::Redis => "default",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mongodb" => Ok(DbType::Mongodb),
            "redis" => Ok(DbType::Redis),
            other => Err(format!("unknown db type: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum DbSize {
    Small,
    Medium,
    Large,
}

impl DbSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbSize::Small => "small",
            DbSize::Medium => "medium",
            DbSize::Large => "large",
        }
    }
}

impl FromStr for DbSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small" => Ok(DbSize::Small),
            "medium" => Ok(DbSize::Medium),
            "large" => Ok(DbSize::Large),
            other => Err(format!("unknown db size: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DbMode {
    // MongoDB
    Standalone,
    ReplicaSet,
    Sharded,
    // Redis
    Basic,
    Sentinel,
    Cluster,
}

impl DbMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DbMode::Standalone => "standalone",
            DbMode::ReplicaSet => "replica_set",
            DbMode::Sharded => "sharded",
            DbMode::Basic => "basic",
            DbMode::Sentinel => "sentinel",
            DbMode::Cluster => "cluster",
        }
    }

    pub fn is_valid_for(&self, db_type: DbType) -> bool {
        match db_type {
            DbType::Mongodb => matches!(self, DbMode::Standalone | DbMode::ReplicaSet | DbMode::Sharded),
            DbType::Redis => matches!(self, DbMode::Basic | DbMode::Sentinel | DbMode::Cluster),
        }
    }

    /// headless service 가 필요한 다중 노드 모드
    pub fn is_clustered(&self) -> bool {
        matches!(self, DbMode::ReplicaSet | DbMode::Sentinel | DbMode::Cluster)
    }
}

impl FromStr for DbMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standalone" => Ok(DbMode::Standalone),
            "replica_set" => Ok(DbMode::ReplicaSet),
            "sharded" => Ok(DbMode::Sharded),
            "basic" => Ok(DbMode::Basic),
            "sentinel" => Ok(DbMode::Sentinel),
            "cluster" => Ok(DbMode::Cluster),
            other => Err(format!("unknown db mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Paused,
    Error,
    Deleting,
    Maintenance,
    BackingUp,
    Restoring,
    Upgrading,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Error => "error",
            InstanceStatus::Deleting => "deleting",
            InstanceStatus::Maintenance => "maintenance",
            InstanceStatus::BackingUp => "backing_up",
            InstanceStatus::Restoring => "restoring",
            InstanceStatus::Upgrading => "upgrading",
        }
    }

    /// 허용된 다음 상태
    pub fn allowed_targets(&self) -> &'static [InstanceStatus] {
        use InstanceStatus::*;
        match self {
            Provisioning => &[Running, Error],
            Running => &[Paused, Stopped, Maintenance, BackingUp, Deleting],
            Paused => &[Running, Deleting],
            Stopped => &[Running, Deleting],
            Error => &[Deleting],
            Maintenance => &[Running],
            BackingUp => &[Running],
            Restoring => &[Running, Error],
            Deleting | Upgrading => &[],
        }
    }

    pub fn can_transition_to(&self, target: InstanceStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// 전이 검증 (실패 시 InvalidStatusTransition)
    pub fn transition_to(&self, target: InstanceStatus) -> Result<InstanceStatus, ApiError> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(ApiError::InvalidStatusTransition {
                current: self.as_str().to_string(),
                target: target.as_str().to_string(),
            })
        }
    }

    pub fn can_delete(&self) -> bool {
        *self != InstanceStatus::Deleting
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use InstanceStatus::*;
        Ok(match s {
            "provisioning" => Provisioning,
            "running" => Running,
            "stopped" => Stopped,
            "paused" => Paused,
            "error" => Error,
            "deleting" => Deleting,
            "maintenance" => Maintenance,
            "backing_up" => BackingUp,
            "restoring" => Restoring,
            "upgrading" => Upgrading,
            other => return Err(format!("unknown instance status: {}", other)),
        })
    }
}

/// 리소스 스펙
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceSpec {
    /// vCPU 코어 수
    pub cpu: i32,
    /// MB
    pub memory: i32,
    /// GB
    pub disk: i32,
}

impl ResourceSpec {
    pub fn size(&self) -> DbSize {
        if self.memory <= 512 && self.cpu <= 1 {
            DbSize::Small
        } else if self.memory <= 2048 && self.cpu <= 2 {
            DbSize::Medium
        } else {
            DbSize::Large
        }
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if !(1..=8).contains(&self.cpu) {
            return Err(ApiError::InvalidResourceSpec("cpu must be between 1 and 8".into()));
        }
        if !(256..=16384).contains(&self.memory) {
            return Err(ApiError::InvalidResourceSpec(
                "memory must be between 256 and 16384 MB".into(),
            ));
        }
        if !(1..=500).contains(&self.disk) {
            return Err(ApiError::InvalidResourceSpec("disk must be between 1 and 500 GB".into()));
        }
        Ok(())
    }
}

/// 레몬 비용
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LemonCost {
    pub creation_cost: i64,
    /// 프리셋은 소수 단위 가능 (과금 시 누적 후 정수 차감)
    pub hourly_lemons: f64,
    pub minimum_lemons: f64,
}

impl LemonCost {
    /// 프리셋이 아닐 경우 리소스로 직접 계산
    pub fn custom(db_type: DbType, resources: &ResourceSpec) -> Self {
        let mut base = match db_type {
            DbType::Redis => resources.memory / 512,
            DbType::Mongodb => resources.memory / 1024 * 3,
        } as i64;

        // 1 vCPU 초과분
        if resources.cpu > 1 {
            base += (resources.cpu as i64 - 1) * 2;
        }

        // 10GB 초과분
        if resources.disk > 10 {
            base += (resources.disk as i64 - 10) / 10;
        }

        let base = base.max(1);

        LemonCost {
            creation_cost: base * 10,
            hourly_lemons: base as f64,
            minimum_lemons: (base * 24) as f64,
        }
    }

    /// 한 시간 과금 (선결제): (차감할 정수 레몬, 남는 잔여분)
    ///
    /// 잔여분으로 모자라면 부족분을 올림해 차감하고 남는 소수는 이월
    pub fn hourly_charge(&self, credit: f64) -> (i64, f64) {
        let need = self.hourly_lemons - credit;
        if need <= 0.0 {
            return (0, -need);
        }
        let debit = need.ceil() as i64;
        (debit, debit as f64 - need)
    }

    pub fn to_response(&self) -> CostResponse {
        CostResponse {
            creation_cost: self.creation_cost,
            hourly_lemons: self.hourly_lemons,
            daily_lemons: self.hourly_lemons * 24.0,
            monthly_lemons: self.hourly_lemons * 24.0 * 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostResponse {
    pub creation_cost: i64,
    pub hourly_lemons: f64,
    pub daily_lemons: f64,
    pub monthly_lemons: f64,
}

/// 백업 설정
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    pub enabled: bool,
    /// cron 형식 (분 시 일 월 요일)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<i32>,
    /// PVC 크기 (예: 10Gi)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

impl BackupConfig {
    pub const DEFAULT_SCHEDULE: &'static str = "0 2 * * *";
    pub const DEFAULT_RETENTION_DAYS: i32 = 7;
    pub const DEFAULT_STORAGE_SIZE: &'static str = "10Gi";

    pub fn validate(&self) -> Result<(), ApiError> {
        if let Some(schedule) = &self.schedule {
            if !is_valid_cron(schedule) {
                return Err(ApiError::invalid_param("backupSchedule", "invalid cron expression"));
            }
        }
        if let Some(days) = self.retention_days {
            if !(1..=30).contains(&days) {
                return Err(ApiError::invalid_param(
                    "backupRetentionDays",
                    "must be between 1 and 30",
                ));
            }
        }
        Ok(())
    }
}

/// 5필드 cron 표현식 검증
pub fn is_valid_cron(schedule: &str) -> bool {
    let parts: Vec<&str> = schedule.split_whitespace().collect();
    if parts.len() != 5 {
        return false;
    }

    const RANGES: [(u32, u32); 5] = [(0, 59), (0, 23), (1, 31), (1, 12), (0, 6)];

    parts.iter().zip(RANGES).all(|(field, (min, max))| {
        if *field == "*" || field.starts_with("*/") || field.contains('-') || field.contains(',') {
            return true;
        }
        field
            .parse::<u32>()
            .map(|n| (min..=max).contains(&n))
            .unwrap_or(false)
    })
}

/// 인스턴스 이름: 쿠버네티스 리소스 이름 규칙 (소문자/숫자/하이픈, 양끝 영숫자)
pub fn validate_instance_name(name: &str) -> Result<(), ApiError> {
    let len_ok = (3..=50).contains(&name.len());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let edges_ok = name
        .chars()
        .next()
        .zip(name.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);

    if len_ok && chars_ok && edges_ok {
        Ok(())
    } else {
        Err(ApiError::InvalidInstanceName(name.to_string()))
    }
}

/// 인스턴스 (선언 상태, DB row 기준)
#[derive(Debug, Clone)]
pub struct DbInstance {
    pub id: i64,
    pub external_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub db_type: DbType,
    pub size: DbSize,
    pub mode: DbMode,
    pub created_from_preset: Option<String>,
    pub resources: ResourceSpec,
    pub cost: LemonCost,
    pub status: InstanceStatus,
    pub status_reason: Option<String>,
    pub k8s_namespace: Option<String>,
    pub k8s_resource_name: Option<String>,
    /// reconciler 가 ready 를 관측한 뒤에만 채워짐
    pub endpoint: Option<String>,
    pub port: Option<i32>,
    pub external_port: Option<i32>,
    pub config: Map<String, Value>,
    pub backup: BackupConfig,
    /// 선결제 후 남은 소수 잔여분 (다음 과금에서 먼저 소진)
    pub billing_credit: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_billed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DbInstance {
    pub fn to_response(&self) -> InstanceResponse {
        InstanceResponse {
            id: self.external_id,
            name: self.name.clone(),
            db_type: self.db_type,
            size: self.size,
            mode: self.mode,
            status: self.status,
            status_reason: self.status_reason.clone(),
            resources: self.resources,
            cost: self.cost.to_response(),
            endpoint: self.endpoint.clone(),
            port: self.port,
            external_port: self.external_port,
            backup_enabled: self.backup.enabled,
            config: self.config.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            created_from_preset: self.created_from_preset.clone(),
            paused_at: self.paused_at,
        }
    }
}

// ============ Request/Response Types ============

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceRequest {
    pub name: String,
    pub preset_id: Option<String>,

    // 커스텀 옵션 (presetId 없을 때)
    #[serde(rename = "type")]
    pub db_type: Option<DbType>,
    pub mode: Option<DbMode>,
    pub resources: Option<ResourceSpec>,
    pub config: Option<Map<String, Value>>,

    #[serde(default)]
    pub backup_enabled: bool,
    pub backup_schedule: Option<String>,
    pub backup_retention_days: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_uri: Option<String>,
}

impl Credentials {
    /// 외부 접속 URI (NodePort 할당된 경우만)
    pub fn external_uri(db_type: DbType, username: &str, password: &str, host: &str, port: i32) -> String {
        match db_type {
            DbType::Mongodb => format!(
                "mongodb://{}:{}@{}:{}/admin?authSource=admin",
                username, password, host, port
            ),
            DbType::Redis => format!("redis://{}:{}@{}:{}", username, password, host, port),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceResponse {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: DbType,
    pub size: DbSize,
    pub mode: DbMode,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub resources: ResourceSpec,
    pub cost: CostResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_port: Option<i32>,
    pub backup_enabled: bool,
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_from_preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
}

/// 생성 응답 (credentials 는 생성 시에만 포함)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInstanceResponse {
    #[serde(flatten)]
    pub instance: InstanceResponse,
    pub credentials: Credentials,
}

/// 프리셋
#[derive(Debug, Clone)]
pub struct Preset {
    pub id: String,
    pub db_type: DbType,
    pub size: DbSize,
    pub mode: DbMode,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub use_cases: Vec<String>,
    pub resources: ResourceSpec,
    pub cost: LemonCost,
    pub default_config: Map<String, Value>,
    pub sort_order: i32,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetResponse {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub description: String,
    pub mode: DbMode,
    pub size: DbSize,
    pub use_cases: Vec<String>,
    pub resources: ResourceSpec,
    pub cost: CostResponse,
}

impl From<&Preset> for PresetResponse {
    fn from(p: &Preset) -> Self {
        PresetResponse {
            id: p.id.clone(),
            name: p.name.clone(),
            icon: p.icon.clone(),
            description: p.description.clone(),
            mode: p.mode,
            size: p.size,
            use_cases: p.use_cases.clone(),
            resources: p.resources,
            cost: p.cost.to_response(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ListPresetsResponse {
    pub mongodb: Vec<PresetResponse>,
    pub redis: Vec<PresetResponse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateCostRequest {
    #[serde(rename = "type")]
    pub db_type: DbType,
    pub resources: ResourceSpec,
    pub mode: Option<DbMode>,
    pub config: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateCostResponse {
    pub size: DbSize,
    pub cost: CostResponse,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreResponse {
    pub backup_id: Uuid,
    pub job_name: String,
}

// ============ Backup ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Manual,
    Scheduled,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Manual => "manual",
            BackupType::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BackupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Completed | BackupStatus::Failed)
    }
}

impl FromStr for BackupStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "completed" => Ok(BackupStatus::Completed),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(format!("unknown backup status: {}", other)),
        }
    }
}

/// 백업 메타데이터 (실제 데이터는 클러스터 PVC)
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    #[serde(skip)]
    pub id: i64,
    #[serde(skip)]
    pub instance_id: i64,
    #[serde(rename = "id")]
    pub external_id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub k8s_job_name: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

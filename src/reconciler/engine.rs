//! 엔진별 워크로드 렌더링 seam

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ExecAction, Probe, ResourceRequirements, SecretKeySelector,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::{mongodb::MongoEngine, redis::RedisEngine};
use crate::error::ApiResult;
use crate::k8s::DbInstanceSpec;
use crate::types::{DbType, EngineConfig, ResourceSpec};

/// MongoDB / Redis 가 각각 구현
pub trait Engine: Send + Sync {
    /// 컨테이너/포트 이름
    fn name(&self) -> &'static str;

    fn port(&self) -> i32;

    fn config_file_name(&self) -> &'static str;

    fn config_mount_path(&self) -> &'static str;

    /// 설정 파일 내용 (ConfigMap)
    fn render_config(&self, spec: &DbInstanceSpec) -> ApiResult<String>;

    /// DB 컨테이너 (config/data 볼륨 마운트 포함)
    fn container(&self, spec: &DbInstanceSpec, secret_name: &str) -> ApiResult<Container>;

    /// volumeClaimTemplate "data" 필요 여부
    fn has_data_volume(&self, spec: &DbInstanceSpec) -> ApiResult<bool>;

    /// Secret 키 구성 (비밀번호는 호출자가 생성)
    fn secret_data(&self, username: &str, password: &str) -> BTreeMap<String, String>;

    fn backup_image(&self) -> &'static str;

    /// /backup 에 `${BACKUP_NAME}` 아카이브 생성, 보존 기간 지난 파일 정리
    fn backup_script(&self) -> &'static str;

    /// `${BACKUP_NAME}` 아카이브로 복원
    fn restore_script(&self) -> &'static str;
}

pub fn engine_for(db_type: DbType) -> &'static dyn Engine {
    match db_type {
        DbType::Mongodb => &MongoEngine,
        DbType::Redis => &RedisEngine,
    }
}

/// 모드/설정에서 결정되는 목표 replica 수
pub fn desired_replicas(spec: &DbInstanceSpec) -> ApiResult<i32> {
    Ok(EngineConfig::parse(spec.db_type, &spec.config)?.replicas(spec.mode))
}

// ============ Container helpers ============

pub(crate) fn resource_requirements(resources: &ResourceSpec) -> ResourceRequirements {
    let list = BTreeMap::from([
        ("cpu".to_string(), Quantity(format!("{}m", resources.cpu * 1000))),
        ("memory".to_string(), Quantity(format!("{}Mi", resources.memory))),
    ]);

    // requests == limits (Guaranteed QoS)
    ResourceRequirements {
        requests: Some(list.clone()),
        limits: Some(list),
        ..Default::default()
    }
}

pub(crate) fn secret_env(name: &str, secret_name: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: Some(secret_name.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn plain_env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// (initialDelay, period, timeout, failureThreshold)
pub(crate) fn exec_probe(command: &[&str], timing: (i32, i32, i32, i32)) -> Probe {
    let (initial_delay, period, timeout, failure_threshold) = timing;
    Probe {
        exec: Some(ExecAction {
            command: Some(command.iter().map(|s| s.to_string()).collect()),
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(timeout),
        failure_threshold: Some(failure_threshold),
        ..Default::default()
    }
}

pub(crate) const LIVENESS_TIMING: (i32, i32, i32, i32) = (30, 10, 5, 3);
pub(crate) const READINESS_TIMING: (i32, i32, i32, i32) = (10, 5, 5, 3);

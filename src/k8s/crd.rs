//! DBInstance custom resource
//!
//! `kubectl get dbi -A` 로 조회되는 선언 상태. spec 은 API 서버가,
//! status 는 reconciler 가 (목표 상태 `state` 는 API 서버도) 기록한다.

use chrono::{DateTime, SecondsFormat, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::names;
use crate::types::{BackupConfig, DbMode, DbSize, DbType, InstanceStatus, ResourceSpec};

pub const FINALIZER: &str = "dbinstance.dbtree.cloud/finalizer";

pub const CONDITION_PROVISIONED: &str = "Provisioned";
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_ERROR: &str = "Error";

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "dbtree.cloud",
    version = "v1",
    kind = "DBInstance",
    root = "DbInstanceResource",
    plural = "dbinstances",
    shortname = "dbi",
    namespaced,
    status = "DbInstanceStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Size","type":"string","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".status.endpoint"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub db_type: DbType,
    pub size: DbSize,
    pub mode: DbMode,
    pub secret_ref: SecretRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_from_preset: Option<String>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub backup: BackupConfig,
    pub user_id: String,
    /// 엔진 설정 (MongoConfig / RedisConfig 형태의 자유 객체)
    #[serde(default)]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub config: Map<String, Value>,
    /// API 서버 쪽 인스턴스 ID
    pub external_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct SecretRef {
    pub name: String,
}

/// 관측 상태
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DbInstanceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<InstanceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_metrics_update: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_billed_at: Option<String>,
    /// 항상 직렬화 (null 패치로 재개 시 지움)
    #[serde(default)]
    pub paused_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    /// "True" | "False" | "Unknown"
    pub status: String,
    pub reason: String,
    pub message: String,
    /// RFC3339
    pub last_transition_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl DbInstanceStatus {
    /// 목표 상태만 담은 패치
    pub fn desired(state: InstanceStatus, reason: impl Into<String>) -> Self {
        Self {
            state: Some(state),
            status_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// 조건 갱신
    ///
    /// status 값이 바뀔 때만 last_transition_time 이 움직인다
    pub fn set_condition(
        &mut self,
        type_: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
        now: DateTime<Utc>,
    ) {
        let status = if status { "True" } else { "False" };

        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status.to_string();
                    existing.last_transition_time = rfc3339(now);
                }
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.observed_generation = generation;
            }
            None => self.conditions.push(Condition {
                type_: type_.to_string(),
                status: status.to_string(),
                reason: reason.to_string(),
                message: message.to_string(),
                last_transition_time: rfc3339(now),
                observed_generation: generation,
            }),
        }
    }
}

impl DbInstanceResource {
    pub fn instance_name(&self) -> String {
        self.name_any()
    }

    pub fn user_namespace(&self) -> String {
        self.namespace()
            .unwrap_or_else(|| names::namespace(&self.spec.user_id))
    }

    pub fn state(&self) -> Option<InstanceStatus> {
        self.status.as_ref().and_then(|s| s.state)
    }

    pub fn current_status(&self) -> DbInstanceStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == FINALIZER)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn secret_name(&self) -> String {
        if self.spec.secret_ref.name.is_empty() {
            names::secret(&self.instance_name())
        } else {
            self.spec.secret_ref.name.clone()
        }
    }
}

pub fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema
        .extensions
        .insert("x-kubernetes-preserve-unknown-fields".into(), Value::Bool(true));
    Schema::Object(schema)
}

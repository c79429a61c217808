//! Kubernetes Integration
//!
//! # Interview Q&A
//!
//! Q: API 서버와 reconciler 가 어떻게 상태를 주고받는가?
//! A: `DBInstance` 커스텀 리소스 하나가 경계
//!    - API 서버(생명주기 서비스)는 spec 을 쓰고, 일시정지/재개 같은 목표 상태를 `status.state` 에 패치
//!    - reconciler 는 spec + `status.state` 를 읽고 워크로드를 수렴시킨 뒤 관측 결과를 status 에 기록
//!
//! Q: 왜 server-side apply 인가?
//! A: 같은 입력으로 몇 번을 적용해도 결과가 같음 (reconcile 멱등성)
//!    - create/update 분기 없이 "원하는 모양" 만 보냄
//!    - field manager 로 소유 필드 충돌 감지
//!
//! Q: 테스트는?
//! A: `ClusterClient` trait 뒤에 kube 구현(`KubeClient`)과 인메모리 fake 를 둠

pub mod client;
pub mod crd;
#[cfg(test)]
pub mod fake;

pub use client::KubeClient;
pub use crd::{Condition, DbInstanceResource, DbInstanceSpec, DbInstanceStatus, SecretRef};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::error::ApiResult;

/// server-side apply field manager
pub const FIELD_MANAGER: &str = "dbtree-control-plane";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_USER_ID: &str = "dbtree.cloud/user-id";
pub const LABEL_INSTANCE_ID: &str = "dbtree.cloud/instance-id";
pub const MANAGED_BY: &str = "dbtree";

/// 리소스 이름 규칙
pub mod names {
    pub fn namespace(user_id: &str) -> String {
        format!("user-{}", user_id)
    }

    pub fn secret(instance: &str) -> String {
        format!("{}-secret", instance)
    }

    pub fn service(instance: &str) -> String {
        format!("{}-svc", instance)
    }

    pub fn external_service(instance: &str) -> String {
        format!("{}-external", instance)
    }

    pub fn stateful_set(instance: &str) -> String {
        format!("{}-sts", instance)
    }

    pub fn config_map(instance: &str) -> String {
        format!("{}-config", instance)
    }

    pub fn network_policy(instance: &str) -> String {
        format!("{}-netpol", instance)
    }

    pub fn backup_cron_job(instance: &str) -> String {
        format!("{}-backup", instance)
    }

    pub fn backup_pvc(instance: &str) -> String {
        format!("{}-backup-pvc", instance)
    }

    /// volumeClaimTemplate "data" 로 만들어지는 PVC
    pub fn data_pvc(instance: &str, ordinal: i32) -> String {
        format!("data-{}-{}", stateful_set(instance), ordinal)
    }

    pub fn cluster_endpoint(instance: &str, namespace: &str) -> String {
        format!("{}.{}.svc.cluster.local", service(instance), namespace)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkloadKind {
    Secret,
    ConfigMap,
    Service,
    StatefulSet,
    NetworkPolicy,
    CronJob,
    PersistentVolumeClaim,
    Job,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Secret => "Secret",
            WorkloadKind::ConfigMap => "ConfigMap",
            WorkloadKind::Service => "Service",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::NetworkPolicy => "NetworkPolicy",
            WorkloadKind::CronJob => "CronJob",
            WorkloadKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            WorkloadKind::Job => "Job",
        }
    }
}

/// 인스턴스 하나가 소유하는 네임스페이스 리소스
#[derive(Debug, Clone)]
pub enum Workload {
    Secret(Secret),
    ConfigMap(ConfigMap),
    Service(Service),
    StatefulSet(StatefulSet),
    NetworkPolicy(NetworkPolicy),
    CronJob(CronJob),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Job(Job),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Secret(_) => WorkloadKind::Secret,
            Workload::ConfigMap(_) => WorkloadKind::ConfigMap,
            Workload::Service(_) => WorkloadKind::Service,
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::NetworkPolicy(_) => WorkloadKind::NetworkPolicy,
            Workload::CronJob(_) => WorkloadKind::CronJob,
            Workload::PersistentVolumeClaim(_) => WorkloadKind::PersistentVolumeClaim,
            Workload::Job(_) => WorkloadKind::Job,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::Secret(o) => &o.metadata,
            Workload::ConfigMap(o) => &o.metadata,
            Workload::Service(o) => &o.metadata,
            Workload::StatefulSet(o) => &o.metadata,
            Workload::NetworkPolicy(o) => &o.metadata,
            Workload::CronJob(o) => &o.metadata,
            Workload::PersistentVolumeClaim(o) => &o.metadata,
            Workload::Job(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or_default()
    }
}

/// 클러스터 API
///
/// API 서버(생성/삭제/상태 패치)와 reconciler(워크로드 수렴)가 함께 사용
#[async_trait]
pub trait ClusterClient: Send + Sync {
    // ============ DBInstance ============

    async fn create_db_instance(&self, resource: &DbInstanceResource) -> ApiResult<()>;

    async fn get_db_instance(&self, namespace: &str, name: &str) -> ApiResult<Option<DbInstanceResource>>;

    /// 없으면 성공으로 간주
    async fn delete_db_instance(&self, namespace: &str, name: &str) -> ApiResult<()>;

    /// status merge patch (None 필드는 건드리지 않음)
    async fn patch_db_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DbInstanceStatus,
    ) -> ApiResult<()>;

    async fn set_finalizers(&self, namespace: &str, name: &str, finalizers: &[String]) -> ApiResult<()>;

    // ============ Workloads ============

    async fn ensure_namespace(&self, name: &str, user_id: &str) -> ApiResult<()>;

    /// server-side apply
    async fn apply(&self, workload: &Workload) -> ApiResult<()>;

    /// 없으면 성공으로 간주
    async fn delete(&self, kind: WorkloadKind, namespace: &str, name: &str) -> ApiResult<()>;

    /// label selector 로 PVC 일괄 삭제 (삭제 수 반환)
    async fn delete_pvcs(&self, namespace: &str, selector: &str) -> ApiResult<usize>;

    async fn get_secret(&self, namespace: &str, name: &str) -> ApiResult<Option<Secret>>;

    async fn get_stateful_set(&self, namespace: &str, name: &str) -> ApiResult<Option<StatefulSet>>;

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32) -> ApiResult<()>;

    async fn get_job(&self, namespace: &str, name: &str) -> ApiResult<Option<Job>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(names::namespace("42"), "user-42");
        assert_eq!(names::secret("shop"), "shop-secret");
        assert_eq!(names::data_pvc("shop", 0), "data-shop-sts-0");
        assert_eq!(
            names::cluster_endpoint("shop", "user-42"),
            "shop-svc.user-42.svc.cluster.local"
        );
    }
}

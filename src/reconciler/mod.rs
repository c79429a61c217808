//! DBInstance Reconciler
//!
//! # Interview Q&A
//!
//! Q: reconcile 한 번은 무엇을 하는가?
//! A: 선언 상태(spec + status.state)를 보고 워크로드를 한 걸음 수렴시킨 뒤
//!    관측 결과를 status 에 기록하고 다음 확인 시점을 돌려준다
//!    - provisioning: 워크로드 적용 → 모든 replica ready 면 running
//!    - running: 워크로드 유지, ready 여부만 Ready 조건에 반영
//!    - paused / stopped: StatefulSet 을 0 으로 (PVC 는 유지)
//!    - 삭제 중: 하위 리소스 정리 후 finalizer 제거
//!
//! Q: 멱등성은?
//! A: 같은 입력이면 같은 객체를 server-side apply, status 는 바뀐 경우에만 패치
//!    - Secret 은 한 번 만들면 다시 만들지 않음 (비밀번호 안정)
//!
//! Q: requeue 주기?
//! A: provisioning 5초, 정상 5분, pod 미준비 10초, 일시정지 30초, error 5분,
//!    에러 조건 기록 직후 1분

pub mod engine;
pub mod mongodb;
pub mod redis;
pub mod resources;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::ResourceExt;

use crate::error::{ApiError, ApiResult};
use crate::k8s::crd::{
    rfc3339, CONDITION_ERROR, CONDITION_PROVISIONED, CONDITION_READY, FINALIZER,
};
use crate::k8s::{
    names, ClusterClient, DbInstanceResource, DbInstanceStatus, KubeClient, Workload, WorkloadKind,
    LABEL_INSTANCE,
};
use crate::types::InstanceStatus;

use self::engine::{desired_replicas, engine_for, Engine};

pub const REQUEUE_PROVISIONING: Duration = Duration::from_secs(5);
pub const REQUEUE_STEADY: Duration = Duration::from_secs(5 * 60);
pub const REQUEUE_NOT_READY: Duration = Duration::from_secs(10);
pub const REQUEUE_SUSPENDED: Duration = Duration::from_secs(30);
pub const REQUEUE_ERROR_STATE: Duration = Duration::from_secs(5 * 60);
pub const REQUEUE_AFTER_ERROR: Duration = Duration::from_secs(60);

pub struct Reconciler {
    cluster: Arc<dyn ClusterClient>,
}

impl Reconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>) -> Self {
        Self { cluster }
    }

    /// 한 번의 수렴. 다음 확인까지의 시간을 반환 (None = 변경 이벤트까지 대기)
    pub async fn reconcile(&self, cr: &DbInstanceResource) -> ApiResult<Option<Duration>> {
        if cr.is_being_deleted() {
            self.finalize(cr).await?;
            return Ok(None);
        }

        if !cr.has_finalizer() {
            let mut finalizers = cr.finalizers().to_vec();
            finalizers.push(FINALIZER.to_string());
            self.cluster
                .set_finalizers(&cr.user_namespace(), &cr.instance_name(), &finalizers)
                .await?;
        }

        let engine = engine_for(cr.spec.db_type);

        match cr.state() {
            None | Some(InstanceStatus::Provisioning) => self.provision(cr, engine).await,
            Some(InstanceStatus::Running) => self.run(cr, engine).await,
            Some(state @ (InstanceStatus::Paused | InstanceStatus::Stopped)) => {
                self.suspend(cr, state).await
            }
            Some(InstanceStatus::Error) => {
                tracing::debug!(instance = %cr.instance_name(), "instance in error state, waiting");
                Ok(Some(REQUEUE_ERROR_STATE))
            }
            // API 서버가 CR 삭제를 이어서 요청함
            Some(InstanceStatus::Deleting) => Ok(None),
            Some(
                InstanceStatus::Maintenance
                | InstanceStatus::BackingUp
                | InstanceStatus::Restoring
                | InstanceStatus::Upgrading,
            ) => {
                // 작업 Job 이 도는 동안 워크로드만 유지
                if let Err(e) = self.ensure_workloads(cr, engine).await {
                    tracing::warn!(instance = %cr.instance_name(), error = %e, "workload apply failed");
                }
                Ok(Some(REQUEUE_SUSPENDED))
            }
        }
    }

    // ============ State handlers ============

    async fn provision(&self, cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<Option<Duration>> {
        if let Err(e) = self.ensure_workloads(cr, engine).await {
            return self.fail(cr, "ProvisioningFailed", &e).await;
        }

        let namespace = cr.user_namespace();
        let name = cr.instance_name();
        let now = Utc::now();

        let Some(sts) = self
            .cluster
            .get_stateful_set(&namespace, &names::stateful_set(&name))
            .await?
        else {
            return Ok(Some(REQUEUE_PROVISIONING));
        };

        let desired = desired_replicas(&cr.spec)?;
        let ready = ready_replicas(&sts);
        let generation = cr.metadata.generation;

        let mut status = cr.current_status();
        status.k8s_namespace = Some(namespace.clone());
        status.k8s_resource_name = Some(name.clone());
        status.secret_ref = Some(cr.secret_name());
        status.observed_generation = generation;

        if ready < desired {
            status.state = Some(InstanceStatus::Provisioning);
            status.status_reason = Some(format!("waiting for pods ({}/{})", ready, desired));
            status.set_condition(
                CONDITION_PROVISIONED,
                false,
                "Provisioning",
                "workload created, waiting for pods",
                generation,
                now,
            );
            self.update_phase(cr, status).await?;
            return Ok(Some(REQUEUE_PROVISIONING));
        }

        status.state = Some(InstanceStatus::Running);
        status.status_reason = Some("all replicas ready".to_string());
        status.endpoint = Some(names::cluster_endpoint(&name, &namespace));
        status.port = Some(engine.port());
        status.set_condition(CONDITION_PROVISIONED, true, "Provisioned", "workload provisioned", generation, now);
        status.set_condition(CONDITION_READY, true, "AllPodsReady", "all pods are ready", generation, now);
        if status.condition(CONDITION_ERROR).is_some() {
            status.set_condition(CONDITION_ERROR, false, "Recovered", "", generation, now);
        }
        self.update_phase(cr, status).await?;

        tracing::info!(instance = %name, namespace = %namespace, "instance provisioned");
        Ok(Some(REQUEUE_STEADY))
    }

    async fn run(&self, cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<Option<Duration>> {
        let namespace = cr.user_namespace();
        let name = cr.instance_name();
        let now = Utc::now();
        let generation = cr.metadata.generation;
        let mut status = cr.current_status();

        let Some(sts) = self
            .cluster
            .get_stateful_set(&namespace, &names::stateful_set(&name))
            .await?
        else {
            tracing::warn!(instance = %name, "statefulset missing, reprovisioning");
            status.state = Some(InstanceStatus::Provisioning);
            status.status_reason = Some("statefulset not found, reprovisioning".to_string());
            self.update_phase(cr, status).await?;
            return Ok(Some(REQUEUE_PROVISIONING));
        };

        // 재개 시 replica 복구도 여기서 (목표 replica 로 다시 적용)
        if let Err(e) = self.ensure_workloads(cr, engine).await {
            tracing::warn!(instance = %name, error = %e, "workload apply failed");
            status.set_condition(CONDITION_ERROR, true, "ApplyFailed", &e.to_string(), generation, now);
            self.update_status(cr, status).await?;
            return Ok(Some(REQUEUE_AFTER_ERROR));
        }

        let desired = desired_replicas(&cr.spec)?;
        let ready = ready_replicas(&sts);
        status.observed_generation = generation;
        status.paused_at = None;

        if ready < desired {
            status.set_condition(
                CONDITION_READY,
                false,
                "PodsNotReady",
                &format!("only {}/{} pods are ready", ready, desired),
                generation,
                now,
            );
            self.update_status(cr, status).await?;
            return Ok(Some(REQUEUE_NOT_READY));
        }

        status.set_condition(CONDITION_READY, true, "AllPodsReady", "all pods are ready", generation, now);
        if status.condition(CONDITION_ERROR).is_some() {
            status.set_condition(CONDITION_ERROR, false, "Recovered", "", generation, now);
        }
        self.update_status(cr, status).await?;
        Ok(Some(REQUEUE_STEADY))
    }

    /// paused / stopped: replica 0, 데이터 볼륨 유지
    async fn suspend(&self, cr: &DbInstanceResource, state: InstanceStatus) -> ApiResult<Option<Duration>> {
        let namespace = cr.user_namespace();
        let sts_name = names::stateful_set(&cr.instance_name());
        let now = Utc::now();

        if let Some(sts) = self.cluster.get_stateful_set(&namespace, &sts_name).await? {
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            if replicas != 0 {
                self.cluster.scale_stateful_set(&namespace, &sts_name, 0).await?;
                tracing::info!(instance = %cr.instance_name(), state = %state, "scaled down");
            }
        }

        let (reason, message) = if state == InstanceStatus::Paused {
            ("InstancePaused", "instance is paused to save resources")
        } else {
            ("InstanceStopped", "instance is stopped")
        };

        let mut status = cr.current_status();
        if status.paused_at.is_none() {
            status.paused_at = Some(rfc3339(now));
        }
        status.set_condition(CONDITION_READY, false, reason, message, cr.metadata.generation, now);
        self.update_status(cr, status).await?;

        Ok(Some(REQUEUE_SUSPENDED))
    }

    /// 하위 리소스 정리 (개별 실패는 로그만), 마지막에 finalizer 제거
    async fn finalize(&self, cr: &DbInstanceResource) -> ApiResult<()> {
        if !cr.has_finalizer() {
            return Ok(());
        }

        let namespace = cr.user_namespace();
        let name = cr.instance_name();

        let owned = [
            (WorkloadKind::Service, names::service(&name)),
            (WorkloadKind::Service, names::external_service(&name)),
            (WorkloadKind::NetworkPolicy, names::network_policy(&name)),
            (WorkloadKind::CronJob, names::backup_cron_job(&name)),
            (WorkloadKind::StatefulSet, names::stateful_set(&name)),
            (WorkloadKind::ConfigMap, names::config_map(&name)),
            (WorkloadKind::Secret, cr.secret_name()),
        ];

        for (kind, object) in owned {
            if let Err(e) = self.cluster.delete(kind, &namespace, &object).await {
                tracing::warn!(instance = %name, kind = kind.as_str(), object = %object, error = %e, "cleanup failed");
            }
        }

        match self
            .cluster
            .delete_pvcs(&namespace, &format!("{}={}", LABEL_INSTANCE, name))
            .await
        {
            Ok(count) => tracing::info!(instance = %name, pvcs = count, "volumes released"),
            Err(e) => tracing::warn!(instance = %name, error = %e, "pvc cleanup failed"),
        }

        let remaining: Vec<String> = cr
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        self.cluster.set_finalizers(&namespace, &name, &remaining).await?;

        tracing::info!(instance = %name, namespace = %namespace, "instance finalized");
        Ok(())
    }

    // ============ Helpers ============

    async fn ensure_workloads(&self, cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<()> {
        self.ensure_secret(cr, engine).await?;

        self.cluster
            .apply(&Workload::ConfigMap(resources::config_map(cr, engine)?))
            .await?;
        self.cluster
            .apply(&Workload::Service(resources::service(cr, engine)))
            .await?;
        self.cluster
            .apply(&Workload::StatefulSet(resources::stateful_set(cr, engine)?))
            .await?;
        self.cluster
            .apply(&Workload::NetworkPolicy(resources::network_policy(cr, engine)))
            .await?;

        let namespace = cr.user_namespace();
        if cr.spec.backup.enabled {
            self.cluster
                .apply(&Workload::PersistentVolumeClaim(resources::backup_pvc(cr)))
                .await?;
            self.cluster
                .apply(&Workload::CronJob(resources::backup_cron_job(cr, engine)))
                .await?;
        } else {
            self.cluster
                .delete(
                    WorkloadKind::CronJob,
                    &namespace,
                    &names::backup_cron_job(&cr.instance_name()),
                )
                .await?;
        }

        Ok(())
    }

    /// 없을 때만 생성 (기존 비밀번호는 절대 바꾸지 않음)
    async fn ensure_secret(&self, cr: &DbInstanceResource, engine: &dyn Engine) -> ApiResult<()> {
        let name = cr.secret_name();
        if self
            .cluster
            .get_secret(&cr.user_namespace(), &name)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let password = resources::generate_password();
        self.cluster
            .apply(&Workload::Secret(resources::secret(cr, engine, &password)))
            .await?;
        tracing::info!(instance = %cr.instance_name(), secret = %name, "credentials secret generated");
        Ok(())
    }

    async fn fail(&self, cr: &DbInstanceResource, reason: &str, err: &ApiError) -> ApiResult<Option<Duration>> {
        tracing::warn!(instance = %cr.instance_name(), reason, error = %err, "reconcile failed");

        let message = err.to_string();
        let mut status = cr.current_status();
        status.state = Some(InstanceStatus::Error);
        status.status_reason = Some(message.clone());
        status.set_condition(CONDITION_ERROR, true, reason, &message, cr.metadata.generation, Utc::now());
        self.update_phase(cr, status).await?;

        Ok(Some(REQUEUE_AFTER_ERROR))
    }

    /// 관측 필드만 패치
    ///
    /// `state`/`statusReason` 은 API 서버가 쓰는 목표 상태. 오래된 `cr` 에서 복사한 값으로 덮지 않음
    async fn update_status(&self, cr: &DbInstanceResource, mut status: DbInstanceStatus) -> ApiResult<()> {
        if cr.status.as_ref() == Some(&status) {
            return Ok(());
        }
        status.state = None;
        status.status_reason = None;
        self.patch_status(cr, &status).await
    }

    /// reconciler 가 단계를 바꿀 때 (provisioning → running/error, running → provisioning)
    async fn update_phase(&self, cr: &DbInstanceResource, status: DbInstanceStatus) -> ApiResult<()> {
        if cr.status.as_ref() == Some(&status) {
            return Ok(());
        }
        self.patch_status(cr, &status).await
    }

    async fn patch_status(&self, cr: &DbInstanceResource, status: &DbInstanceStatus) -> ApiResult<()> {
        self.cluster
            .patch_db_instance_status(&cr.user_namespace(), &cr.instance_name(), status)
            .await
    }
}

fn ready_replicas(sts: &StatefulSet) -> i32 {
    sts.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

// ============ Controller ============

async fn reconcile(cr: Arc<DbInstanceResource>, reconciler: Arc<Reconciler>) -> Result<Action, ApiError> {
    let requeue = reconciler.reconcile(&cr).await?;
    Ok(requeue.map(Action::requeue).unwrap_or_else(Action::await_change))
}

fn error_policy(cr: Arc<DbInstanceResource>, err: &ApiError, _reconciler: Arc<Reconciler>) -> Action {
    tracing::warn!(instance = %cr.name_any(), error = %err, "reconcile error, retrying");
    Action::requeue(REQUEUE_AFTER_ERROR)
}

/// 모든 네임스페이스의 DBInstance 와 소유 리소스 감시
///
/// SIGTERM / Ctrl-C 를 받으면 진행 중인 reconcile 을 마치고 종료
pub async fn run(client: kube::Client) {
    let instances: Api<DbInstanceResource> = Api::all(client.clone());
    let reconciler = Arc::new(Reconciler::new(Arc::new(KubeClient::new(client.clone()))));

    tracing::info!("reconciler started");

    Controller::new(instances, watcher::Config::default())
        .owns(Api::<StatefulSet>::all(client.clone()), watcher::Config::default())
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(Api::<ConfigMap>::all(client.clone()), watcher::Config::default())
        .owns(Api::<CronJob>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => tracing::debug!(instance = %object.name, ?action, "reconciled"),
                Err(e) => tracing::warn!(error = %e, "controller error"),
            }
        })
        .await;

    tracing::info!("reconciler stopped");
}

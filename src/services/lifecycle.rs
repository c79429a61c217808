//! Instance Lifecycle Service
//!
//! # Interview Q&A
//!
//! Q: 생성 도중 실패하면 차감한 레몬은?
//! A: 차감 이후 단계는 모두 보상 동작으로 감쌈
//!
//!    ```text
//!    1. 개수 제한        ─┐
//!    2. 이름 중복        ─┼─ 실패해도 잔액 변화 없음
//!    3. 스펙 결정/검증   ─┤
//!    4. 잔액 확인 + 차감 ─┘
//!    5. namespace / Secret / DBInstance ─┐
//!    6. NodePort (실패해도 계속)          ├─ 실패 시: 클러스터 정리 → 포트 반납 → 환불
//!    7. DB row insert                    ─┘
//!    ```
//!
//!    - 환불 자체가 실패하면 `incident = "refund_failed"` 로 error 로그 (운영 알림 대상)
//!    - 호출자는 항상 원래 에러를 받음
//!
//! Q: 목표 상태는 누가 바꾸는가?
//! A: 이 서비스가 row 와 CR 의 `status.state` 를 함께 바꿈
//!    - CR 패치가 먼저, row 는 낙관적 전이 (`from` 이 맞을 때만)
//!    - 실제 워크로드 변경(스케일 0 등)은 reconciler 몫
//!
//! Q: endpoint 는 언제 row 에 들어가는가?
//! A: `sync_observed` 에서만, row 가 provisioning 일 때만
//!    - 그 외 상태에서는 row 가 권위 있는 선언 상태

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use k8s_openapi::api::batch::v1::Job;
use serde_json::Map;
use uuid::Uuid;

use crate::db::{BackupStore, BillingCharge, InstanceStore, PortStore, PresetStore};
use crate::error::{ApiError, ApiResult};
use crate::k8s::{
    names, ClusterClient, DbInstanceResource, DbInstanceSpec, DbInstanceStatus, SecretRef,
    Workload, WorkloadKind,
};
use crate::reconciler::engine::engine_for;
use crate::reconciler::resources;
use crate::services::Ledger;
use crate::types::engine::{default_config, merge_config};
use crate::types::{
    validate_instance_name, ActionType, BackupConfig, BackupRecord, BackupStatus, BackupType,
    CreateInstanceRequest, CreateInstanceResponse, Credentials, DbInstance, DbMode, DbSize,
    DbType, EngineConfig, EstimateCostRequest, EstimateCostResponse, InstanceResponse,
    InstanceStatus, LedgerRequest, LemonCost, ListPresetsResponse, PresetResponse, ResourceSpec,
    RestoreResponse, MAX_INSTANCES_PER_USER,
};

/// 생성 요청에서 결정된 최종 스펙
#[derive(Debug, Clone)]
struct EffectiveSpec {
    db_type: DbType,
    mode: DbMode,
    size: DbSize,
    resources: ResourceSpec,
    cost: LemonCost,
    config: Map<String, serde_json::Value>,
    preset_id: Option<String>,
}

/// 생성 중 만들어진 것 (보상 대상)
#[derive(Debug, Default)]
struct Created {
    secret: bool,
    resource: bool,
    external_service: bool,
    port: bool,
}

pub struct InstanceLifecycle {
    instances: Arc<dyn InstanceStore>,
    ports: Arc<dyn PortStore>,
    presets: Arc<dyn PresetStore>,
    backups: Arc<dyn BackupStore>,
    ledger: Ledger,
    cluster: Arc<dyn ClusterClient>,
    external_host: String,
}

impl InstanceLifecycle {
    pub fn new(
        instances: Arc<dyn InstanceStore>,
        ports: Arc<dyn PortStore>,
        presets: Arc<dyn PresetStore>,
        backups: Arc<dyn BackupStore>,
        ledger: Ledger,
        cluster: Arc<dyn ClusterClient>,
        external_host: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            ports,
            presets,
            backups,
            ledger,
            cluster,
            external_host: external_host.into(),
        }
    }

    pub(crate) fn instances(&self) -> &Arc<dyn InstanceStore> {
        &self.instances
    }

    pub(crate) fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // ============ Create ============

    pub async fn create(&self, user_id: Uuid, req: CreateInstanceRequest) -> ApiResult<CreateInstanceResponse> {
        validate_instance_name(&req.name)?;

        // 1. 개수 제한
        if self.instances.count_active(user_id).await? >= MAX_INSTANCES_PER_USER {
            return Err(ApiError::LimitExceeded { max: MAX_INSTANCES_PER_USER });
        }

        // 2. 이름 중복
        if self.instances.name_taken(user_id, &req.name).await? {
            return Err(ApiError::InstanceNameConflict(req.name.clone()));
        }

        // 3. 스펙 결정
        let spec = self.resolve_spec(&req).await?;
        let backup = BackupConfig {
            enabled: req.backup_enabled,
            schedule: req.backup_schedule.clone(),
            retention_days: req.backup_retention_days,
            storage_size: None,
        };
        backup.validate()?;

        // 4. 잔액 확인 + 차감
        let external_id = Uuid::new_v4();
        let amount = spec.cost.creation_cost;
        let balance = self.ledger.balance(user_id).await?;
        if balance < amount {
            return Err(ApiError::insufficient(amount as f64, balance));
        }
        if amount > 0 {
            self.ledger
                .debit_for(
                    user_id,
                    Some(external_id),
                    amount,
                    ActionType::InstanceCreate,
                    Some(format!("create {}", req.name)),
                )
                .await?;
        }

        let now = Utc::now();
        let namespace = names::namespace(&user_id.to_string());
        let mut row = DbInstance {
            id: 0,
            external_id,
            user_id,
            name: req.name.clone(),
            db_type: spec.db_type,
            size: spec.size,
            mode: spec.mode,
            created_from_preset: spec.preset_id.clone(),
            resources: spec.resources,
            cost: spec.cost,
            status: InstanceStatus::Provisioning,
            status_reason: Some("waiting for workload".to_string()),
            k8s_namespace: Some(namespace.clone()),
            k8s_resource_name: Some(req.name.clone()),
            endpoint: None,
            port: None,
            external_port: None,
            config: spec.config.clone(),
            backup,
            billing_credit: 0.0,
            created_at: now,
            updated_at: now,
            last_billed_at: Some(now),
            paused_at: None,
            deleted_at: None,
        };
        let resource = declared_resource(&row);
        let password = resources::generate_password();
        let mut created = Created::default();

        // 5. namespace / Secret / DBInstance
        if let Err(e) = self.provision_declared(&resource, &password, &mut created).await {
            self.rollback(&row, &created, amount, &e).await;
            return Err(e);
        }

        // 6. NodePort (실패해도 내부 접속은 가능하므로 계속)
        match self.expose(&resource, &mut created).await {
            Ok(port) => row.external_port = Some(port),
            Err(e) => {
                tracing::warn!(%user_id, instance_id = %external_id, error = %e, "external port assignment failed");
                if created.port {
                    if let Err(e) = self.ports.release_port(external_id).await {
                        tracing::warn!(instance_id = %external_id, error = %e, "port release failed");
                    }
                    created.port = false;
                }
            }
        }

        // 7. row 저장
        let row = match self.instances.insert_instance(&row, MAX_INSTANCES_PER_USER).await {
            Ok(row) => row,
            Err(e) => {
                self.rollback(&row, &created, amount, &e).await;
                return Err(e);
            }
        };

        tracing::info!(
            %user_id,
            instance_id = %row.external_id,
            name = %row.name,
            db_type = %row.db_type,
            cost = amount,
            "instance created"
        );

        let username = row.db_type.username().to_string();
        let credentials = Credentials {
            external_host: row.external_port.map(|_| self.external_host.clone()),
            external_port: row.external_port,
            external_uri: row.external_port.map(|port| {
                Credentials::external_uri(row.db_type, &username, &password, &self.external_host, port)
            }),
            username,
            password,
        };

        Ok(CreateInstanceResponse {
            instance: row.to_response(),
            credentials,
        })
    }

    /// preset 또는 커스텀 옵션으로 최종 스펙 결정
    async fn resolve_spec(&self, req: &CreateInstanceRequest) -> ApiResult<EffectiveSpec> {
        let overrides = req.config.clone().unwrap_or_default();

        if let Some(preset_id) = &req.preset_id {
            let preset = self
                .presets
                .find_preset(preset_id)
                .await?
                .ok_or_else(|| ApiError::not_found("preset", preset_id))?;

            let config = merge_config(
                &merge_config(&default_config(preset.db_type), &preset.default_config),
                &overrides,
            );
            EngineConfig::validate(preset.db_type, preset.mode, &config, &preset.resources)?;

            return Ok(EffectiveSpec {
                db_type: preset.db_type,
                mode: preset.mode,
                size: preset.size,
                resources: preset.resources,
                cost: preset.cost,
                config,
                preset_id: Some(preset.id),
            });
        }

        let db_type = req.db_type.ok_or_else(|| ApiError::MissingParameter("type".into()))?;
        let resources = req
            .resources
            .ok_or_else(|| ApiError::MissingParameter("resources".into()))?;
        resources.validate()?;

        let mode = req.mode.unwrap_or_else(|| db_type.default_mode());
        if !mode.is_valid_for(db_type) {
            return Err(ApiError::invalid_param(
                "mode",
                format!("{} is not supported for {}", mode.as_str(), db_type),
            ));
        }

        let config = merge_config(&default_config(db_type), &overrides);
        EngineConfig::validate(db_type, mode, &config, &resources)?;

        Ok(EffectiveSpec {
            db_type,
            mode,
            size: resources.size(),
            resources,
            cost: LemonCost::custom(db_type, &resources),
            config,
            preset_id: None,
        })
    }

    async fn provision_declared(
        &self,
        resource: &DbInstanceResource,
        password: &str,
        created: &mut Created,
    ) -> ApiResult<()> {
        let namespace = resource.user_namespace();
        let engine = engine_for(resource.spec.db_type);

        self.cluster
            .ensure_namespace(&namespace, &resource.spec.user_id)
            .await?;

        self.cluster
            .apply(&Workload::Secret(resources::secret(resource, engine, password)))
            .await?;
        created.secret = true;

        self.cluster.create_db_instance(resource).await?;
        created.resource = true;
        Ok(())
    }

    /// 포트 할당 + NodePort Service
    async fn expose(&self, resource: &DbInstanceResource, created: &mut Created) -> ApiResult<i32> {
        let external_id = parse_external_id(resource)?;
        let port = self.ports.allocate_port(external_id).await?;
        created.port = true;

        // 저장된 CR(uid 포함)을 owner 로
        let owner = self
            .cluster
            .get_db_instance(&resource.user_namespace(), &resource.instance_name())
            .await?
            .unwrap_or_else(|| resource.clone());
        let engine = engine_for(owner.spec.db_type);

        self.cluster
            .apply(&Workload::Service(resources::external_service(&owner, engine, port)))
            .await?;
        created.external_service = true;
        Ok(port)
    }

    /// 생성 보상: 클러스터 정리 → 포트 반납 → 환불
    async fn rollback(&self, row: &DbInstance, created: &Created, amount: i64, cause: &ApiError) {
        let (namespace, name) = cluster_key(row);
        let instance_id = row.external_id;

        if created.external_service {
            if let Err(e) = self
                .cluster
                .delete(WorkloadKind::Service, &namespace, &names::external_service(&name))
                .await
            {
                tracing::warn!(%instance_id, error = %e, "rollback: external service cleanup failed");
            }
        }
        if created.resource {
            if let Err(e) = self.cluster.delete_db_instance(&namespace, &name).await {
                tracing::warn!(%instance_id, error = %e, "rollback: DBInstance cleanup failed");
            }
        }
        if created.secret {
            if let Err(e) = self
                .cluster
                .delete(WorkloadKind::Secret, &namespace, &names::secret(&name))
                .await
            {
                tracing::warn!(%instance_id, error = %e, "rollback: secret cleanup failed");
            }
        }
        if created.port {
            if let Err(e) = self.ports.release_port(instance_id).await {
                tracing::warn!(%instance_id, error = %e, "rollback: port release failed");
            }
        }

        if amount <= 0 {
            return;
        }

        match self
            .ledger
            .credit_for(
                row.user_id,
                Some(instance_id),
                amount,
                ActionType::InstanceCreateRefund,
                Some(format!("refund {}: {}", row.name, cause)),
            )
            .await
        {
            Ok(_) => tracing::info!(user_id = %row.user_id, %instance_id, amount, cause = %cause, "creation refunded"),
            Err(e) => tracing::error!(
                incident = "refund_failed",
                user_id = %row.user_id,
                %instance_id,
                amount,
                cause = %cause,
                error = %e,
                "creation refund failed"
            ),
        }
    }

    // ============ Read ============

    pub async fn list(&self, user_id: Uuid) -> ApiResult<Vec<InstanceResponse>> {
        let rows = self.instances.list_instances(user_id).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let row = match self.sync_row(row.clone()).await {
                Ok(synced) => synced,
                Err(e) => {
                    tracing::warn!(instance_id = %row.external_id, error = %e, "status sync failed");
                    row
                }
            };
            out.push(row.to_response());
        }
        Ok(out)
    }

    pub async fn get(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<InstanceResponse> {
        Ok(self.sync_observed(user_id, instance_id).await?.to_response())
    }

    /// provisioning 인 row 에만 reconciler 관측 결과 반영
    pub async fn sync_observed(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<DbInstance> {
        let row = self.find(user_id, instance_id).await?;
        self.sync_row(row).await
    }

    async fn sync_row(&self, row: DbInstance) -> ApiResult<DbInstance> {
        if row.status != InstanceStatus::Provisioning {
            return Ok(row);
        }

        let (namespace, name) = cluster_key(&row);
        let Some(resource) = self.cluster.get_db_instance(&namespace, &name).await? else {
            return Ok(row);
        };
        let observed = resource.current_status();

        let applied = match observed.state {
            Some(InstanceStatus::Running) => {
                self.instances
                    .apply_observed(
                        row.id,
                        InstanceStatus::Running,
                        observed.status_reason.as_deref(),
                        observed.endpoint.as_deref(),
                        observed.port,
                    )
                    .await?
            }
            Some(InstanceStatus::Error) => {
                self.instances
                    .apply_observed(
                        row.id,
                        InstanceStatus::Error,
                        observed.status_reason.as_deref(),
                        None,
                        None,
                    )
                    .await?
            }
            _ => false,
        };

        if !applied {
            return Ok(row);
        }

        tracing::info!(instance_id = %row.external_id, state = ?observed.state, "observed status applied");
        self.find(row.user_id, row.external_id).await
    }

    async fn find(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<DbInstance> {
        self.instances
            .find_instance(user_id, instance_id)
            .await?
            .ok_or_else(|| ApiError::not_found("instance", instance_id))
    }

    // ============ Delete ============

    pub async fn delete(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<()> {
        let row = self.find(user_id, instance_id).await?;
        self.delete_row(&row, "deleted by user").await
    }

    /// deleting 표시 → 포트 반납 → CR 삭제 → soft delete
    ///
    /// 포트/클러스터 실패는 로그만 남기고 row 삭제는 진행
    pub(crate) async fn delete_row(&self, row: &DbInstance, reason: &str) -> ApiResult<()> {
        if !row.status.can_delete() {
            return Err(ApiError::InvalidStatusTransition {
                current: row.status.as_str().to_string(),
                target: InstanceStatus::Deleting.as_str().to_string(),
            });
        }

        let now = Utc::now();
        if !self
            .instances
            .transition(row.id, row.status, InstanceStatus::Deleting, Some(reason), now)
            .await?
        {
            return Err(concurrent_change(row));
        }

        if let Err(e) = self.ports.release_port(row.external_id).await {
            tracing::warn!(instance_id = %row.external_id, error = %e, "port release failed");
        }

        let (namespace, name) = cluster_key(row);
        if let Err(e) = self.cluster.delete_db_instance(&namespace, &name).await {
            tracing::warn!(instance_id = %row.external_id, error = %e, "DBInstance delete failed");
        }

        self.instances.soft_delete_instance(row.id, now).await?;

        tracing::info!(user_id = %row.user_id, instance_id = %row.external_id, reason, "instance deleted");
        Ok(())
    }

    // ============ Control ============

    /// paused/stopped → running (한 시간 요금 즉시 청구)
    pub async fn start(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<InstanceResponse> {
        let row = self.find(user_id, instance_id).await?;
        if !matches!(row.status, InstanceStatus::Paused | InstanceStatus::Stopped) {
            return Err(ApiError::InvalidStatusTransition {
                current: row.status.as_str().to_string(),
                target: InstanceStatus::Running.as_str().to_string(),
            });
        }

        self.resume_charged(&row, "started by user", Utc::now()).await?;
        Ok(self.find(user_id, instance_id).await?.to_response())
    }

    /// running → stopped (잔액 불필요)
    pub async fn stop(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<InstanceResponse> {
        let row = self.find(user_id, instance_id).await?;
        self.set_state(&row, InstanceStatus::Stopped, "stopped by user").await?;
        Ok(self.find(user_id, instance_id).await?.to_response())
    }

    pub async fn restart(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<InstanceResponse> {
        self.stop(user_id, instance_id).await?;
        self.start(user_id, instance_id).await
    }

    /// paused/stopped → running 후 한 시간 요금 청구
    ///
    /// 전이가 실패하면 차감 없음. 청구가 실패하면 원래 상태로 되돌림
    pub(crate) async fn resume_charged(
        &self,
        row: &DbInstance,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ApiResult<()> {
        let (debit, _) = row.cost.hourly_charge(row.billing_credit);
        let balance = self.ledger.balance(row.user_id).await?;
        if balance < debit {
            return Err(ApiError::insufficient(debit as f64, balance));
        }

        self.set_state_at(row, InstanceStatus::Running, reason, now).await?;
        let running = DbInstance {
            status: InstanceStatus::Running,
            paused_at: None,
            ..row.clone()
        };

        if let Err(cause) = self.charge_hour(&running, now).await {
            // paused 로 돌아갈 때는 만료 시계를 원래 paused_at 기준으로 유지
            let revert_at = row.paused_at.unwrap_or(now);
            if let Err(e) = self
                .set_state_at(&running, row.status, "resume charge failed", revert_at)
                .await
            {
                tracing::error!(
                    incident = "resume_revert_failed",
                    user_id = %row.user_id,
                    instance_id = %row.external_id,
                    cause = %cause,
                    error = %e,
                    "instance left running without charge"
                );
            }
            return Err(cause);
        }
        Ok(())
    }

    /// 한 시간 요금 청구 (선결제 잔여분 먼저 소진)
    ///
    /// 차감과 청구 시각 기록은 한 트랜잭션. 읽은 뒤 다른 tick 이 청구했으면 충돌 에러
    pub(crate) async fn charge_hour(&self, row: &DbInstance, now: DateTime<Utc>) -> ApiResult<i64> {
        let (debit, credit) = row.cost.hourly_charge(row.billing_credit);
        let charge = BillingCharge {
            instance_id: row.id,
            previous: row.last_billed_at,
            billed_at: now,
            credit,
            debit: (debit > 0).then(|| LedgerRequest {
                user_id: row.user_id,
                delta: -debit,
                action: ActionType::InstanceMaintain,
                note: Some(format!("maintain {}", row.name)),
                instance_id: Some(row.external_id),
            }),
        };

        if !self.instances.record_charge(&charge).await? {
            return Err(concurrent_change(row));
        }
        tracing::debug!(user_id = %row.user_id, instance_id = %row.external_id, debit, "hour charged");
        Ok(debit)
    }

    pub(crate) async fn set_state(&self, row: &DbInstance, target: InstanceStatus, reason: &str) -> ApiResult<()> {
        self.set_state_at(row, target, reason, Utc::now()).await
    }

    /// 목표 상태 변경: 전이 검증 → CR status.state 패치 → row 낙관적 전이
    pub(crate) async fn set_state_at(
        &self,
        row: &DbInstance,
        target: InstanceStatus,
        reason: &str,
        at: DateTime<Utc>,
    ) -> ApiResult<()> {
        row.status.transition_to(target)?;

        let (namespace, name) = cluster_key(row);
        self.cluster
            .patch_db_instance_status(&namespace, &name, &DbInstanceStatus::desired(target, reason))
            .await?;

        if !self
            .instances
            .transition(row.id, row.status, target, Some(reason), at)
            .await?
        {
            return Err(concurrent_change(row));
        }

        tracing::info!(
            user_id = %row.user_id,
            instance_id = %row.external_id,
            from = %row.status,
            to = %target,
            reason,
            "instance state changed"
        );
        Ok(())
    }

    // ============ Backup / Restore ============

    /// running → backing_up → (Job 실행) → running
    pub async fn backup(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<BackupRecord> {
        let row = self.find(user_id, instance_id).await?;
        row.status.transition_to(InstanceStatus::BackingUp)?;
        let resource = self.stored_resource(&row).await?;
        let engine = engine_for(row.db_type);

        let now = Utc::now();
        let job_name = format!("{}-b{}", row.name, now.timestamp());
        let backup_name = format!("{}-{}", row.name, now.format("%Y%m%d-%H%M%S"));
        let retention = row
            .backup
            .retention_days
            .unwrap_or(BackupConfig::DEFAULT_RETENTION_DAYS);

        self.set_state(&row, InstanceStatus::BackingUp, "manual backup").await?;
        let row = DbInstance {
            status: InstanceStatus::BackingUp,
            ..row
        };

        let outcome = async {
            let launched = async {
                self.cluster
                    .apply(&Workload::PersistentVolumeClaim(resources::backup_pvc(&resource)))
                    .await?;
                self.cluster
                    .apply(&Workload::Job(resources::backup_job(&resource, engine, &job_name, &backup_name)))
                    .await
            }
            .await;

            let record = BackupRecord {
                id: 0,
                instance_id: row.id,
                external_id: Uuid::new_v4(),
                name: backup_name,
                backup_type: BackupType::Manual,
                status: if launched.is_ok() { BackupStatus::Running } else { BackupStatus::Failed },
                k8s_job_name: job_name,
                created_at: now,
                completed_at: launched.is_err().then_some(now),
                expires_at: Some(now + Duration::days(retention as i64)),
                error_message: launched.as_ref().err().map(|e| e.to_string()),
            };
            let record = self.backups.insert_backup(&record).await?;
            launched.map(|_| record)
        }
        .await;

        // 성공/실패와 관계없이 running 으로 복귀
        let settled = self.set_state(&row, InstanceStatus::Running, "backup started").await;
        let record = outcome?;
        settled?;

        tracing::info!(instance_id = %row.external_id, job = %record.k8s_job_name, "backup job launched");
        Ok(record)
    }

    /// 최신순. 끝나지 않은 기록은 Job 상태로 갱신
    pub async fn list_backups(&self, user_id: Uuid, instance_id: Uuid) -> ApiResult<Vec<BackupRecord>> {
        let row = self.find(user_id, instance_id).await?;
        let (namespace, _) = cluster_key(&row);
        let mut records = self.backups.list_backups(row.id).await?;

        for record in records.iter_mut().filter(|r| !r.status.is_terminal()) {
            let job = self.cluster.get_job(&namespace, &record.k8s_job_name).await?;
            let (status, error) = match job.as_ref().map(job_outcome) {
                Some(Some(outcome)) => outcome,
                Some(None) => continue,
                None => (BackupStatus::Failed, Some("backup job not found".to_string())),
            };

            let completed_at = Some(Utc::now());
            self.backups
                .update_backup(record.id, status, completed_at, error.as_deref())
                .await?;
            record.status = status;
            record.completed_at = completed_at;
            record.error_message = error;
        }

        Ok(records)
    }

    /// 완료된 백업으로 복원 (maintenance 창 안에서 Job 실행)
    pub async fn restore(&self, user_id: Uuid, instance_id: Uuid, backup_id: Uuid) -> ApiResult<RestoreResponse> {
        let row = self.find(user_id, instance_id).await?;
        row.status.transition_to(InstanceStatus::Maintenance)?;

        let backup = self
            .backups
            .find_backup(row.id, backup_id)
            .await?
            .ok_or_else(|| ApiError::not_found("backup", backup_id))?;
        if backup.status != BackupStatus::Completed {
            return Err(ApiError::invalid_param("backupId", "backup is not completed"));
        }

        let resource = self.stored_resource(&row).await?;
        let engine = engine_for(row.db_type);

        // Redis 는 data PVC 에 RDB 를 직접 놓으므로 영속화가 켜져 있어야 함
        let mount_data = row.db_type == DbType::Redis;
        if mount_data && !engine.has_data_volume(&resource.spec)? {
            return Err(ApiError::invalid_param(
                "backupId",
                "restore requires persistence to be enabled",
            ));
        }

        let job_name = format!("{}-r{}", row.name, Utc::now().timestamp());

        self.set_state(&row, InstanceStatus::Maintenance, "restoring from backup").await?;
        let row = DbInstance {
            status: InstanceStatus::Maintenance,
            ..row
        };

        let launched = self
            .cluster
            .apply(&Workload::Job(resources::restore_job(
                &resource,
                engine,
                &job_name,
                &backup.name,
                mount_data,
            )))
            .await;

        self.set_state(&row, InstanceStatus::Running, "restore started").await?;
        launched?;

        tracing::info!(instance_id = %row.external_id, backup = %backup.name, job = %job_name, "restore job launched");
        Ok(RestoreResponse {
            backup_id: backup.external_id,
            job_name,
        })
    }

    async fn stored_resource(&self, row: &DbInstance) -> ApiResult<DbInstanceResource> {
        let (namespace, name) = cluster_key(row);
        self.cluster
            .get_db_instance(&namespace, &name)
            .await?
            .ok_or_else(|| ApiError::not_found("DBInstance", &name))
    }

    // ============ Catalog ============

    pub async fn estimate_cost(&self, req: EstimateCostRequest) -> ApiResult<EstimateCostResponse> {
        req.resources.validate()?;

        let mode = req.mode.unwrap_or_else(|| req.db_type.default_mode());
        if !mode.is_valid_for(req.db_type) {
            return Err(ApiError::invalid_param(
                "mode",
                format!("{} is not supported for {}", mode.as_str(), req.db_type),
            ));
        }
        if let Some(config) = &req.config {
            let merged = merge_config(&default_config(req.db_type), config);
            EngineConfig::validate(req.db_type, mode, &merged, &req.resources)?;
        }

        Ok(EstimateCostResponse {
            size: req.resources.size(),
            cost: LemonCost::custom(req.db_type, &req.resources).to_response(),
        })
    }

    /// 엔진별로 묶고 sort_order 순
    pub async fn list_presets(&self) -> ApiResult<ListPresetsResponse> {
        let mut presets: Vec<_> = self
            .presets
            .list_presets()
            .await?
            .into_iter()
            .filter(|p| p.available)
            .collect();
        presets.sort_by_key(|p| p.sort_order);

        let mut response = ListPresetsResponse::default();
        for preset in &presets {
            let entry = PresetResponse::from(preset);
            match preset.db_type {
                DbType::Mongodb => response.mongodb.push(entry),
                DbType::Redis => response.redis.push(entry),
            }
        }
        Ok(response)
    }
}

/// row → DBInstance 선언
fn declared_resource(row: &DbInstance) -> DbInstanceResource {
    let (namespace, name) = cluster_key(row);
    let mut resource = DbInstanceResource::new(
        &name,
        DbInstanceSpec {
            name: row.name.clone(),
            db_type: row.db_type,
            size: row.size,
            mode: row.mode,
            secret_ref: SecretRef { name: names::secret(&name) },
            created_from_preset: row.created_from_preset.clone(),
            resources: row.resources,
            backup: row.backup.clone(),
            user_id: row.user_id.to_string(),
            config: row.config.clone(),
            external_id: row.external_id.to_string(),
        },
    );
    resource.metadata.namespace = Some(namespace);
    resource
}

fn cluster_key(row: &DbInstance) -> (String, String) {
    let namespace = row
        .k8s_namespace
        .clone()
        .unwrap_or_else(|| names::namespace(&row.user_id.to_string()));
    let name = row.k8s_resource_name.clone().unwrap_or_else(|| row.name.clone());
    (namespace, name)
}

fn parse_external_id(resource: &DbInstanceResource) -> ApiResult<Uuid> {
    Uuid::parse_str(&resource.spec.external_id).map_err(ApiError::internal)
}

fn concurrent_change(row: &DbInstance) -> ApiError {
    ApiError::Conflict {
        resource: "instance".to_string(),
        detail: format!("{} changed concurrently", row.external_id),
    }
}

/// Job 종료 조건 → 백업 상태 (None = 아직 실행 중)
fn job_outcome(job: &Job) -> Option<(BackupStatus, Option<String>)> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    conditions
        .iter()
        .filter(|c| c.status == "True")
        .find_map(|c| match c.type_.as_str() {
            "Complete" => Some((BackupStatus::Completed, None)),
            "Failed" => Some((
                BackupStatus::Failed,
                Some(c.message.clone().unwrap_or_else(|| "backup job failed".to_string())),
            )),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockStore;
    use crate::k8s::fake::FakeCluster;
    use crate::types::{TxStatus, PORT_RANGE_END, PORT_RANGE_START};
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};
    use k8s_openapi::api::core::v1::Service;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    struct Harness {
        store: Arc<MockStore>,
        cluster: Arc<FakeCluster>,
        lifecycle: InstanceLifecycle,
    }

    fn setup() -> Harness {
        let store = Arc::new(MockStore::new());
        let cluster = Arc::new(FakeCluster::new());
        let lifecycle = InstanceLifecycle::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            Ledger::new(store.clone()),
            cluster.clone(),
            "db.example.com",
        );
        Harness { store, cluster, lifecycle }
    }

    fn preset_request(name: &str, preset: &str) -> CreateInstanceRequest {
        CreateInstanceRequest {
            name: name.into(),
            preset_id: Some(preset.into()),
            ..Default::default()
        }
    }

    fn ns(user: Uuid) -> String {
        names::namespace(&user.to_string())
    }

    /// 실패 시 원장: 차감 + 같은 금액의 환불
    fn assert_refunded(store: &MockStore, user: Uuid, amount: i64, balance: i64) {
        let entries = store.entries_for(user);
        let n = entries.len();
        assert_eq!(entries[n - 2].action, ActionType::InstanceCreate);
        assert_eq!(entries[n - 2].amount, -amount);
        assert_eq!(entries[n - 1].action, ActionType::InstanceCreateRefund);
        assert_eq!(entries[n - 1].amount, amount);
        assert_eq!(store.user(user).lemon_balance, balance);
        assert!(store.all_instances().is_empty());
        assert!(store.allocated_ports().is_empty());
    }

    #[tokio::test]
    async fn test_create_from_preset() {
        let h = setup();
        let user = h.store.add_user(20);

        let created = h
            .lifecycle
            .create(user, preset_request("shop", "mongodb-small"))
            .await
            .unwrap();

        assert_eq!(created.instance.status, InstanceStatus::Provisioning);
        assert!(created.instance.endpoint.is_none());
        assert_eq!(created.instance.created_from_preset.as_deref(), Some("mongodb-small"));
        assert_eq!(h.store.user(user).lemon_balance, 10);

        let port = created.instance.external_port.unwrap();
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&port));
        assert_eq!(created.credentials.username, "admin");
        assert_eq!(created.credentials.password.len(), 16);
        assert_eq!(
            created.credentials.external_uri.as_deref().unwrap(),
            format!(
                "mongodb://admin:{}@db.example.com:{}/admin?authSource=admin",
                created.credentials.password, port
            )
        );

        // Secret 에 응답과 같은 비밀번호
        let secret: k8s_openapi::api::core::v1::Secret = h
            .cluster
            .typed(WorkloadKind::Secret, &ns(user), "shop-secret")
            .unwrap();
        assert_eq!(secret.string_data.unwrap()["password"], created.credentials.password);

        let resource = h.cluster.instance(&ns(user), "shop").unwrap();
        assert_eq!(resource.spec.external_id, created.instance.id.to_string());
        assert_eq!(resource.spec.config["version"], "7.0");

        // NodePort service 는 저장된 CR 을 owner 로
        let svc: Service = h
            .cluster
            .typed(WorkloadKind::Service, &ns(user), "shop-external")
            .unwrap();
        let owners = svc.metadata.owner_references.unwrap();
        assert_eq!(owners[0].uid, resource.metadata.uid.unwrap());
    }

    #[tokio::test]
    async fn test_create_custom_validates_and_prices() {
        let h = setup();
        let user = h.store.add_user(200);

        let mut req = CreateInstanceRequest {
            name: "cache".into(),
            db_type: Some(DbType::Redis),
            resources: Some(ResourceSpec { cpu: 2, memory: 1024, disk: 10 }),
            ..Default::default()
        };
        req.mode = Some(DbMode::ReplicaSet);
        let err = h.lifecycle.create(user, req.clone()).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter { .. }));

        req.mode = None;
        let created = h.lifecycle.create(user, req).await.unwrap();
        // base = 1024/512 + 2 = 4
        assert_eq!(created.instance.cost.creation_cost, 40);
        assert_eq!(created.instance.mode, DbMode::Basic);
        assert_eq!(created.instance.config["persistence"], json!(true));
        assert_eq!(h.store.user(user).lemon_balance, 160);
    }

    #[tokio::test]
    async fn test_create_requires_type_without_preset() {
        let h = setup();
        let user = h.store.add_user(100);
        let req = CreateInstanceRequest { name: "cache".into(), ..Default::default() };
        let err = h.lifecycle.create(user, req).await.unwrap_err();
        assert!(matches!(err, ApiError::MissingParameter(p) if p == "type"));
        assert_eq!(h.store.entries_for(user).len(), 1);
    }

    #[tokio::test]
    async fn test_limit_and_name_conflict_do_not_charge() {
        let h = setup();
        let user = h.store.add_user(100);

        h.lifecycle.create(user, preset_request("one", "mongodb-small")).await.unwrap();
        let err = h
            .lifecycle
            .create(user, preset_request("one", "mongodb-small"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InstanceNameConflict(_)));

        h.lifecycle.create(user, preset_request("two", "mongodb-small")).await.unwrap();
        let err = h
            .lifecycle
            .create(user, preset_request("three", "mongodb-small"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::LimitExceeded { max: 2 }));
        assert_eq!(h.store.user(user).lemon_balance, 80);
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected_before_debit() {
        let h = setup();
        let user = h.store.add_user(15);
        let err = h
            .lifecycle
            .create(user, preset_request("cache", "redis-medium"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::InsufficientLemons { .. }));
        assert_eq!(h.store.entries_for(user).len(), 1);
        assert!(h.cluster.instance(&ns(user), "cache").is_none());
    }

    #[tokio::test]
    async fn test_cluster_failure_refunds() {
        let h = setup();
        let user = h.store.add_user(30);
        h.cluster.fail_on("cache");

        let err = h
            .lifecycle
            .create(user, preset_request("cache", "redis-medium"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("simulated cluster failure"));
        assert_refunded(&h.store, user, 20, 30);
        // 먼저 만든 Secret 도 정리
        assert!(h.cluster.names_of(WorkloadKind::Secret).is_empty());
    }

    #[tokio::test]
    async fn test_refund_on_every_post_debit_step() {
        for step in ["namespace", "secret", "insert"] {
            let h = setup();
            let user = h.store.add_user(30);
            match step {
                "namespace" => h.cluster.fail_on(&ns(user)),
                "secret" => h.cluster.fail_on("cache-secret"),
                _ => h.store.fail_instance_insert.store(true, Ordering::SeqCst),
            }

            let result = h.lifecycle.create(user, preset_request("cache", "redis-medium")).await;
            assert!(result.is_err(), "{} should fail", step);
            assert_refunded(&h.store, user, 20, 30);

            if step == "insert" {
                assert!(h.cluster.instance(&ns(user), "cache").is_none());
                assert!(h.cluster.names_of(WorkloadKind::Service).is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_external_port_failure_is_tolerated() {
        let h = setup();
        let user = h.store.add_user(30);
        h.cluster.fail_on("cache-external");

        let created = h
            .lifecycle
            .create(user, preset_request("cache", "redis-medium"))
            .await
            .unwrap();

        assert!(created.instance.external_port.is_none());
        assert!(created.credentials.external_uri.is_none());
        assert!(h.store.allocated_ports().is_empty());
        assert_eq!(h.store.user(user).lemon_balance, 10);
        let successful = h
            .store
            .entries_for(user)
            .iter()
            .filter(|e| e.status == TxStatus::Successful)
            .count();
        assert_eq!(successful, 2);
    }

    #[tokio::test]
    async fn test_sync_observed_only_while_provisioning() {
        let h = setup();
        let user = h.store.add_user(50);
        let created = h
            .lifecycle
            .create(user, preset_request("shop", "mongodb-small"))
            .await
            .unwrap();
        let id = created.instance.id;

        // reconciler 가 아직 아무것도 기록하지 않음
        let row = h.lifecycle.sync_observed(user, id).await.unwrap();
        assert_eq!(row.status, InstanceStatus::Provisioning);

        let mut observed = DbInstanceStatus::desired(InstanceStatus::Running, "all replicas ready");
        observed.endpoint = Some("shop-svc.ns.svc.cluster.local".into());
        observed.port = Some(27017);
        h.cluster
            .patch_db_instance_status(&ns(user), "shop", &observed)
            .await
            .unwrap();

        let got = h.lifecycle.get(user, id).await.unwrap();
        assert_eq!(got.status, InstanceStatus::Running);
        assert_eq!(got.endpoint.as_deref(), Some("shop-svc.ns.svc.cluster.local"));
        assert_eq!(got.port, Some(27017));

        // running 이후에는 클러스터 관측이 row 를 바꾸지 않음
        h.cluster
            .patch_db_instance_status(&ns(user), "shop", &DbInstanceStatus::desired(InstanceStatus::Error, "boom"))
            .await
            .unwrap();
        let row = h.lifecycle.sync_observed(user, id).await.unwrap();
        assert_eq!(row.status, InstanceStatus::Running);
    }

    async fn running_instance(h: &Harness, user: Uuid, name: &str) -> Uuid {
        let created = h.lifecycle.create(user, preset_request(name, "mongodb-small")).await.unwrap();
        let row = h.lifecycle.find(user, created.instance.id).await.unwrap();
        h.store.update_instance(row.id, |i| i.status = InstanceStatus::Running);
        created.instance.id
    }

    #[tokio::test]
    async fn test_stop_start_transitions_and_charges() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;

        let stopped = h.lifecycle.stop(user, id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        let resource = h.cluster.instance(&ns(user), "shop").unwrap();
        assert_eq!(resource.state(), Some(InstanceStatus::Stopped));
        assert_eq!(h.store.user(user).lemon_balance, 10);

        // stopped → stopped 는 허용되지 않음
        let err = h.lifecycle.stop(user, id).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidStatusTransition { .. }));

        let started = h.lifecycle.start(user, id).await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);
        assert_eq!(h.cluster.instance(&ns(user), "shop").unwrap().state(), Some(InstanceStatus::Running));
        // 시간당 0.5 → 1 선결제
        assert_eq!(h.store.user(user).lemon_balance, 9);

        let restarted = h.lifecycle.restart(user, id).await.unwrap();
        assert_eq!(restarted.status, InstanceStatus::Running);
        // 선결제 잔여분 0.5 로 충당
        assert_eq!(h.store.user(user).lemon_balance, 9);
    }

    #[tokio::test]
    async fn test_start_without_balance_stays_stopped() {
        let h = setup();
        let user = h.store.add_user(10);
        let id = running_instance(&h, user, "shop").await;
        h.lifecycle.stop(user, id).await.unwrap();
        assert_eq!(h.store.user(user).lemon_balance, 0);

        let err = h.lifecycle.start(user, id).await.unwrap_err();
        assert!(matches!(err, ApiError::InsufficientLemons { .. }));
        assert_eq!(h.lifecycle.get(user, id).await.unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_start_cluster_failure_keeps_lemons() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;
        h.lifecycle.stop(user, id).await.unwrap();
        h.cluster.fail_on("shop");

        let err = h.lifecycle.start(user, id).await.unwrap_err();
        assert!(err.to_string().contains("simulated cluster failure"));

        assert_eq!(h.store.user(user).lemon_balance, 10);
        assert_eq!(h.store.all_instances()[0].status, InstanceStatus::Stopped);
        assert!(!h
            .store
            .entries_for(user)
            .iter()
            .any(|e| e.action == ActionType::InstanceMaintain));
    }

    #[tokio::test]
    async fn test_resume_reverts_when_hour_already_billed() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;
        let row_id = h.lifecycle.find(user, id).await.unwrap().id;
        let paused_at = Utc::now() - Duration::minutes(10);
        h.store.update_instance(row_id, |i| {
            i.status = InstanceStatus::Paused;
            i.paused_at = Some(paused_at);
        });
        let paused = h.lifecycle.find(user, id).await.unwrap();

        // 읽은 뒤 다른 tick 이 먼저 청구
        h.store
            .update_instance(row_id, |i| i.last_billed_at = Some(Utc::now() + Duration::seconds(1)));

        let err = h
            .lifecycle
            .resume_charged(&paused, "resumed after top-up", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict { .. }));

        let row = h.lifecycle.find(user, id).await.unwrap();
        assert_eq!(row.status, InstanceStatus::Paused);
        assert_eq!(row.paused_at, Some(paused_at));
        assert_eq!(h.store.user(user).lemon_balance, 10);
        assert_eq!(
            h.cluster.instance(&ns(user), "shop").unwrap().state(),
            Some(InstanceStatus::Paused)
        );
    }

    #[tokio::test]
    async fn test_insert_rechecks_instance_limit() {
        let h = setup();
        let user = h.store.add_user(100);
        h.lifecycle.create(user, preset_request("one", "mongodb-small")).await.unwrap();
        h.lifecycle.create(user, preset_request("two", "mongodb-small")).await.unwrap();

        // 개수 확인을 동시에 통과한 세 번째 요청이 저장 단계에 도달
        let mut third = h.store.all_instances()[0].clone();
        third.name = "three".into();
        third.external_id = Uuid::new_v4();
        let err = h
            .store
            .insert_instance(&third, MAX_INSTANCES_PER_USER)
            .await
            .unwrap_err();

        assert!(matches!(err, ApiError::LimitExceeded { max: 2 }));
        assert_eq!(h.store.all_instances().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_releases_port_and_soft_deletes() {
        let h = setup();
        let user = h.store.add_user(20);
        let created = h.lifecycle.create(user, preset_request("shop", "mongodb-small")).await.unwrap();
        let id = created.instance.id;

        h.lifecycle.delete(user, id).await.unwrap();

        assert!(h.store.allocated_ports().is_empty());
        assert!(h.cluster.instance(&ns(user), "shop").is_none());
        let row = &h.store.all_instances()[0];
        assert_eq!(row.status, InstanceStatus::Deleting);
        assert!(row.deleted_at.is_some());
        assert!(matches!(
            h.lifecycle.get(user, id).await.unwrap_err(),
            ApiError::NotFound { .. }
        ));

        // 이름 재사용 가능
        h.lifecycle.create(user, preset_request("shop", "mongodb-small")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_tolerates_cluster_failure() {
        let h = setup();
        let user = h.store.add_user(20);
        let created = h.lifecycle.create(user, preset_request("shop", "mongodb-small")).await.unwrap();
        h.cluster.fail_on("shop");

        h.lifecycle.delete(user, created.instance.id).await.unwrap();
        assert!(h.store.all_instances()[0].deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_backup_then_restore() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;

        let record = h.lifecycle.backup(user, id).await.unwrap();
        assert_eq!(record.status, BackupStatus::Running);
        assert_eq!(record.backup_type, BackupType::Manual);
        assert!(record.k8s_job_name.starts_with("shop-b"));
        assert!(record.k8s_job_name.len() <= 63);
        assert_eq!(h.lifecycle.get(user, id).await.unwrap().status, InstanceStatus::Running);
        assert_eq!(h.cluster.names_of(WorkloadKind::PersistentVolumeClaim), vec!["shop-backup-pvc"]);

        // 완료 전에는 복원 불가
        let err = h.lifecycle.restore(user, id, record.external_id).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidParameter { .. }));

        // Job 완료 흉내
        let namespace = ns(user);
        let mut job: Job = h
            .cluster
            .typed(WorkloadKind::Job, &namespace, &record.k8s_job_name)
            .unwrap();
        job.status = Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: "Complete".into(),
                status: "True".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        h.cluster
            .state
            .lock()
            .unwrap()
            .objects
            .insert(
                (WorkloadKind::Job, namespace.clone(), record.k8s_job_name.clone()),
                serde_json::to_value(&job).unwrap(),
            );

        let backups = h.lifecycle.list_backups(user, id).await.unwrap();
        assert_eq!(backups[0].status, BackupStatus::Completed);
        assert!(backups[0].completed_at.is_some());

        let restored = h.lifecycle.restore(user, id, record.external_id).await.unwrap();
        assert!(restored.job_name.starts_with("shop-r"));
        let job: Job = h
            .cluster
            .typed(WorkloadKind::Job, &namespace, &restored.job_name)
            .unwrap();
        let env = job.spec.unwrap().template.spec.unwrap().containers[0].env.clone().unwrap();
        assert!(env.iter().any(|e| e.name == "BACKUP_NAME" && e.value.as_deref() == Some(record.name.as_str())));
        assert_eq!(h.lifecycle.get(user, id).await.unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn test_backup_requires_running() {
        let h = setup();
        let user = h.store.add_user(20);
        let created = h.lifecycle.create(user, preset_request("shop", "mongodb-small")).await.unwrap();

        let err = h.lifecycle.backup(user, created.instance.id).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidStatusTransition { .. }));
    }

    #[tokio::test]
    async fn test_backup_record_failure_returns_to_running() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;
        h.store.fail_backup_insert.store(true, Ordering::SeqCst);

        assert!(h.lifecycle.backup(user, id).await.is_err());

        let row = h.lifecycle.find(user, id).await.unwrap();
        assert_eq!(row.status, InstanceStatus::Running);
        assert_eq!(
            h.cluster.instance(&ns(user), "shop").unwrap().state(),
            Some(InstanceStatus::Running)
        );

        // backing_up 에 갇히지 않음
        let stopped = h.lifecycle.stop(user, id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_missing_backup_job_marks_failed() {
        let h = setup();
        let user = h.store.add_user(20);
        let id = running_instance(&h, user, "shop").await;
        let record = h.lifecycle.backup(user, id).await.unwrap();

        h.cluster
            .delete(WorkloadKind::Job, &ns(user), &record.k8s_job_name)
            .await
            .unwrap();
        let backups = h.lifecycle.list_backups(user, id).await.unwrap();
        assert_eq!(backups[0].status, BackupStatus::Failed);
        assert_eq!(backups[0].error_message.as_deref(), Some("backup job not found"));
    }

    #[tokio::test]
    async fn test_estimate_cost_and_presets() {
        let h = setup();
        let estimate = h
            .lifecycle
            .estimate_cost(EstimateCostRequest {
                db_type: DbType::Mongodb,
                resources: ResourceSpec { cpu: 2, memory: 2048, disk: 30 },
                mode: None,
                config: None,
            })
            .await
            .unwrap();
        assert_eq!(estimate.size, DbSize::Medium);
        assert_eq!(estimate.cost.creation_cost, 100);
        assert_eq!(estimate.cost.daily_lemons, 240.0);

        let presets = h.lifecycle.list_presets().await.unwrap();
        assert_eq!(presets.mongodb.len(), 2);
        assert_eq!(presets.redis.len(), 1);
    }
}

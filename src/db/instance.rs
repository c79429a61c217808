//! DB instance persistence: 인스턴스, 포트 풀, 프리셋, 백업 기록

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use uuid::Uuid;

use super::models::{BackupRow, InstanceRow, PresetRow};
use super::ledger::apply_in_tx;
use super::repository::{BackupStore, BillingCharge, InstanceStore, PortStore, PresetStore};
use super::{is_unique_violation, Database};
use crate::error::{ApiError, ApiResult};
use crate::types::{
    BackupRecord, BackupStatus, DbInstance, InstanceStatus, Preset, PORT_RANGE_END,
    PORT_RANGE_START, RESERVED_PORTS,
};

const INSTANCE_COLUMNS: &str = r#"
    id, external_id, user_id, name, type, size, mode, created_from_preset,
    cpu, memory, disk, creation_cost, hourly_cost, minimum_lemons,
    status, status_reason, k8s_namespace, k8s_resource_name, endpoint, port, external_port,
    config, backup_enabled, backup_schedule, backup_retention_days, backup_storage_size,
    billing_credit, created_at, updated_at, last_billed_at, paused_at, deleted_at
"#;

const BACKUP_COLUMNS: &str = r#"
    id, instance_id, external_id, name, type, status, k8s_job_name,
    created_at, completed_at, expires_at, error_message
"#;

fn into_instances(rows: Vec<InstanceRow>) -> ApiResult<Vec<DbInstance>> {
    rows.into_iter().map(DbInstance::try_from).collect()
}

#[async_trait]
impl InstanceStore for Database {
    async fn count_active(&self, user_id: Uuid) -> ApiResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM db_instances WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn name_taken(&self, user_id: Uuid, name: &str) -> ApiResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM db_instances
                WHERE user_id = $1 AND name = $2 AND deleted_at IS NULL
            )
            "#,
        )
        .bind(user_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    async fn insert_instance(&self, i: &DbInstance, max_active: i64) -> ApiResult<DbInstance> {
        let mut tx = self.pool.begin().await?;

        // 같은 사용자의 동시 생성은 여기서 직렬화
        let locked: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE id = $1 AND NOT is_deleted FOR UPDATE")
                .bind(i.user_id)
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Err(ApiError::not_found("user", i.user_id));
        }

        let (active,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM db_instances WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(i.user_id)
        .fetch_one(&mut *tx)
        .await?;
        if active >= max_active {
            return Err(ApiError::LimitExceeded { max: max_active });
        }

        let result = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            INSERT INTO db_instances (
                external_id, user_id, name, type, size, mode, created_from_preset,
                cpu, memory, disk, creation_cost, hourly_cost, minimum_lemons,
                status, status_reason, k8s_namespace, k8s_resource_name, endpoint, port, external_port,
                config, backup_enabled, backup_schedule, backup_retention_days, backup_storage_size,
                billing_credit, created_at, updated_at, last_billed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27, $27, $28)
            RETURNING {INSTANCE_COLUMNS}
            "#
        ))
        .bind(i.external_id)
        .bind(i.user_id)
        .bind(&i.name)
        .bind(i.db_type.as_str())
        .bind(i.size.as_str())
        .bind(i.mode.as_str())
        .bind(&i.created_from_preset)
        .bind(i.resources.cpu)
        .bind(i.resources.memory)
        .bind(i.resources.disk)
        .bind(i.cost.creation_cost)
        .bind(i.cost.hourly_lemons)
        .bind(i.cost.minimum_lemons)
        .bind(i.status.as_str())
        .bind(&i.status_reason)
        .bind(&i.k8s_namespace)
        .bind(&i.k8s_resource_name)
        .bind(&i.endpoint)
        .bind(i.port)
        .bind(i.external_port)
        .bind(Json(&i.config))
        .bind(i.backup.enabled)
        .bind(&i.backup.schedule)
        .bind(i.backup.retention_days)
        .bind(&i.backup.storage_size)
        .bind(i.billing_credit)
        .bind(i.created_at)
        .bind(i.last_billed_at)
        .fetch_one(&mut *tx)
        .await;

        match result {
            Ok(row) => {
                tx.commit().await?;
                row.try_into()
            }
            Err(e) if is_unique_violation(&e, "unique_user_instance_name") => {
                Err(ApiError::InstanceNameConflict(i.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_instance(&self, user_id: Uuid, external_id: Uuid) -> ApiResult<Option<DbInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM db_instances
            WHERE user_id = $1 AND external_id = $2 AND deleted_at IS NULL
            "#
        ))
        .bind(user_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(DbInstance::try_from).transpose()
    }

    async fn list_instances(&self, user_id: Uuid) -> ApiResult<Vec<DbInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM db_instances
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        into_instances(rows)
    }

    async fn list_by_status(&self, status: InstanceStatus) -> ApiResult<Vec<DbInstance>> {
        let rows = sqlx::query_as::<_, InstanceRow>(&format!(
            r#"
            SELECT {INSTANCE_COLUMNS}
            FROM db_instances
            WHERE status = $1 AND deleted_at IS NULL
            ORDER BY id
            "#
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        into_instances(rows)
    }

    async fn transition(
        &self,
        id: i64,
        from: InstanceStatus,
        to: InstanceStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE db_instances
            SET status = $3,
                status_reason = $4,
                updated_at = $5,
                paused_at = CASE
                    WHEN $3 = 'paused' THEN $5
                    WHEN $3 = 'running' THEN NULL
                    ELSE paused_at
                END
            WHERE id = $1 AND status = $2 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn apply_observed(
        &self,
        id: i64,
        status: InstanceStatus,
        reason: Option<&str>,
        endpoint: Option<&str>,
        port: Option<i32>,
    ) -> ApiResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE db_instances
            SET status = $2,
                status_reason = $3,
                endpoint = COALESCE($4, endpoint),
                port = COALESCE($5, port),
                updated_at = NOW()
            WHERE id = $1 AND status = 'provisioning' AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(reason)
        .bind(endpoint)
        .bind(port)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_charge(&self, charge: &BillingCharge) -> ApiResult<bool> {
        let mut tx = self.pool.begin().await?;

        // 인스턴스 row 를 먼저 잠가 같은 시간을 두 번 청구하지 않음
        let stamped = sqlx::query(
            r#"
            UPDATE db_instances
            SET last_billed_at = $2, billing_credit = $3
            WHERE id = $1 AND deleted_at IS NULL AND last_billed_at IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(charge.instance_id)
        .bind(charge.billed_at)
        .bind(charge.credit)
        .bind(charge.previous)
        .execute(&mut *tx)
        .await?;
        if stamped.rows_affected() != 1 {
            return Ok(false);
        }

        if let Some(debit) = &charge.debit {
            apply_in_tx(&mut *tx, debit).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn soft_delete_instance(&self, id: i64, at: DateTime<Utc>) -> ApiResult<()> {
        sqlx::query("UPDATE db_instances SET deleted_at = $2, updated_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl PortStore for Database {
    async fn allocate_port(&self, instance_id: Uuid) -> ApiResult<i32> {
        // 이미 할당된 경우 그대로 반환 (재시도 안전)
        let existing: Option<(i32,)> =
            sqlx::query_as("SELECT port FROM port_allocations WHERE instance_external_id = $1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
        if let Some((port,)) = existing {
            return Ok(port);
        }

        // 한 문장으로 최저 미사용 포트 선택 + insert. 경쟁 시 PK 충돌로 한쪽만 성공
        let result = sqlx::query_as::<_, (i32,)>(
            r#"
            INSERT INTO port_allocations (port, instance_external_id)
            SELECT p, $1
            FROM (
                SELECT generate_series($2::INT, $3::INT) AS p
                EXCEPT SELECT port FROM port_allocations
                EXCEPT SELECT UNNEST($4::INT[])
            ) free
            ORDER BY p
            LIMIT 1
            RETURNING port
            "#,
        )
        .bind(instance_id)
        .bind(PORT_RANGE_START)
        .bind(PORT_RANGE_END)
        .bind(RESERVED_PORTS.to_vec())
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(Some((port,))) => Ok(port),
            Ok(None) => Err(ApiError::PortExhausted),
            Err(e) if is_unique_violation(&e, "port_allocations_pkey") => Err(ApiError::Conflict {
                resource: "port".into(),
                detail: "concurrent allocation, retry".into(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn release_port(&self, instance_id: Uuid) -> ApiResult<()> {
        sqlx::query("DELETE FROM port_allocations WHERE instance_external_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl PresetStore for Database {
    async fn list_presets(&self) -> ApiResult<Vec<Preset>> {
        let rows = sqlx::query_as::<_, PresetRow>(
            r#"
            SELECT id, type, size, mode, name, icon, description, use_cases,
                   cpu, memory, disk, creation_cost, hourly_cost, minimum_lemons,
                   default_config, sort_order, available
            FROM db_presets
            WHERE available
            ORDER BY type, sort_order
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Preset::try_from).collect()
    }

    async fn find_preset(&self, id: &str) -> ApiResult<Option<Preset>> {
        let row = sqlx::query_as::<_, PresetRow>(
            r#"
            SELECT id, type, size, mode, name, icon, description, use_cases,
                   cpu, memory, disk, creation_cost, hourly_cost, minimum_lemons,
                   default_config, sort_order, available
            FROM db_presets
            WHERE id = $1 AND available
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Preset::try_from).transpose()
    }
}

#[async_trait]
impl BackupStore for Database {
    async fn insert_backup(&self, r: &BackupRecord) -> ApiResult<BackupRecord> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            r#"
            INSERT INTO backup_records
                (instance_id, external_id, name, type, status, k8s_job_name, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {BACKUP_COLUMNS}
            "#
        ))
        .bind(r.instance_id)
        .bind(r.external_id)
        .bind(&r.name)
        .bind(r.backup_type.as_str())
        .bind(r.status.as_str())
        .bind(&r.k8s_job_name)
        .bind(r.created_at)
        .bind(r.expires_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn list_backups(&self, instance_id: i64) -> ApiResult<Vec<BackupRecord>> {
        let rows = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records WHERE instance_id = $1 ORDER BY created_at DESC"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BackupRecord::try_from).collect()
    }

    async fn find_backup(&self, instance_id: i64, external_id: Uuid) -> ApiResult<Option<BackupRecord>> {
        let row = sqlx::query_as::<_, BackupRow>(&format!(
            "SELECT {BACKUP_COLUMNS} FROM backup_records WHERE instance_id = $1 AND external_id = $2"
        ))
        .bind(instance_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BackupRecord::try_from).transpose()
    }

    async fn update_backup(
        &self,
        id: i64,
        status: BackupStatus,
        completed_at: Option<DateTime<Utc>>,
        error_message: Option<&str>,
    ) -> ApiResult<()> {
        sqlx::query(
            "UPDATE backup_records SET status = $2, completed_at = $3, error_message = $4 WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(completed_at)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

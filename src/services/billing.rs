//! Billing Sweep
//!
//! # Interview Q&A
//!
//! Q: 소수 시간당 요금(0.5 레몬)은 어떻게 정수 원장에 기록하는가?
//! A: 선결제 + 잔여분 이월
//!    - 부족분을 올림해 정수로 차감하고 남는 소수는 row 의 `billing_credit` 에 보관
//!    - 다음 시간은 잔여분부터 소진 → 0.5/h 는 홀수 시간에만 1 레몬 차감
//!
//! Q: 잔액이 바닥나면?
//! A: `InsufficientLemons` → paused 전이 (paused_at 기록)
//!    - CR 의 목표 상태도 paused 로 패치 → reconciler 가 replicas 0 으로 스케일
//!
//! Q: paused 는 언제 끝나는가?
//! A: 매 sweep 마다 한 시간 요금을 낼 수 있는지 확인
//!    - 낼 수 있으면 청구 후 running 으로 재개
//!    - 1시간 이상 못 내면 삭제
//!    - stopped 는 사용자가 세운 것이므로 청구도 삭제도 하지 않음

use chrono::{DateTime, Duration, Utc};

use crate::error::{ApiError, ApiResult};
use crate::services::InstanceLifecycle;
use crate::types::{DbInstance, InstanceStatus};

/// 한 번의 과금 단위
pub const BILLING_PERIOD_MINUTES: i64 = 60;

/// 이 시간 이상 paused 이고 여전히 잔액이 없으면 삭제
pub const PAUSED_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BillingReport {
    pub charged: usize,
    pub paused: usize,
    pub resumed: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl InstanceLifecycle {
    /// running 과금 → paused 정리
    ///
    /// 인스턴스 하나의 실패는 로그만 남기고 다음으로 진행
    pub async fn billing_tick(&self, now: DateTime<Utc>) -> ApiResult<BillingReport> {
        let mut report = BillingReport::default();
        let period = Duration::minutes(BILLING_PERIOD_MINUTES);

        for row in self.instances().list_by_status(InstanceStatus::Running).await? {
            if row.last_billed_at.is_some_and(|at| now - at < period) {
                continue;
            }

            match self.charge_hour(&row, now).await {
                Ok(_) => report.charged += 1,
                Err(ApiError::InsufficientLemons { .. }) => {
                    match self.set_state_at(&row, InstanceStatus::Paused, "insufficient lemons", now).await {
                        Ok(()) => report.paused += 1,
                        Err(e) => {
                            tracing::warn!(instance_id = %row.external_id, error = %e, "pause failed");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(instance_id = %row.external_id, error = %e, "billing failed");
                    report.failed += 1;
                }
            }
        }

        for row in self.instances().list_by_status(InstanceStatus::Paused).await? {
            if let Err(e) = self.settle_paused(&row, now, &mut report).await {
                tracing::warn!(instance_id = %row.external_id, error = %e, "paused settlement failed");
                report.failed += 1;
            }
        }

        if report != BillingReport::default() {
            tracing::info!(
                charged = report.charged,
                paused = report.paused,
                resumed = report.resumed,
                deleted = report.deleted,
                failed = report.failed,
                "billing sweep"
            );
        }
        Ok(report)
    }

    async fn settle_paused(&self, row: &DbInstance, now: DateTime<Utc>, report: &mut BillingReport) -> ApiResult<()> {
        let (debit, _) = row.cost.hourly_charge(row.billing_credit);
        let balance = self.ledger().balance(row.user_id).await?;

        if balance >= debit {
            self.resume_charged(row, "resumed after top-up", now).await?;
            report.resumed += 1;
            return Ok(());
        }

        let expired = row
            .paused_at
            .map_or(true, |at| now - at >= Duration::minutes(PAUSED_EXPIRY_MINUTES));
        if expired {
            self.delete_row(row, "paused without balance").await?;
            report.deleted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::mock::MockStore;
    use crate::k8s::fake::FakeCluster;
    use crate::k8s::{names, ClusterClient, WorkloadKind};
    use crate::reconciler::Reconciler;
    use crate::services::Ledger;
    use crate::types::{ActionType, CreateInstanceRequest};
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};
    use uuid::Uuid;

    struct Harness {
        store: Arc<MockStore>,
        cluster: Arc<FakeCluster>,
        lifecycle: InstanceLifecycle,
        reconciler: Reconciler,
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
        let reconciler = Reconciler::new(cluster.clone());
        Harness { store, cluster, lifecycle, reconciler }
    }

    fn hours(n: i64) -> Duration {
        Duration::hours(n)
    }

    /// 생성 → reconciler 로 running 까지 (반환: row id, 기준 시각)
    async fn running_small_mongo(h: &Harness, user: Uuid) -> (i64, DateTime<Utc>) {
        let created = assert_ok!(
            h.lifecycle
                .create(
                    user,
                    CreateInstanceRequest {
                        name: "shop".into(),
                        preset_id: Some("mongodb-small".into()),
                        ..Default::default()
                    },
                )
                .await
        );
        let namespace = names::namespace(&user.to_string());

        let cr = h.cluster.instance(&namespace, "shop").unwrap();
        h.reconciler.reconcile(&cr).await.unwrap();
        h.cluster.mark_ready(&namespace, &names::stateful_set("shop"));
        let cr = h.cluster.instance(&namespace, "shop").unwrap();
        h.reconciler.reconcile(&cr).await.unwrap();

        let row = h.lifecycle.sync_observed(user, created.instance.id).await.unwrap();
        assert_eq!(row.status, InstanceStatus::Running);
        (row.id, row.last_billed_at.unwrap())
    }

    fn sts_replicas(h: &Harness, user: Uuid) -> i64 {
        h.cluster
            .object(
                WorkloadKind::StatefulSet,
                &names::namespace(&user.to_string()),
                &names::stateful_set("shop"),
            )
            .unwrap()["spec"]["replicas"]
            .as_i64()
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_then_exhaust_pauses_and_scales_down() {
        let h = setup();
        let user = h.store.add_user(20);
        let (id, t0) = running_small_mongo(&h, user).await;
        assert_eq!(h.store.user(user).lemon_balance, 10);
        assert_eq!(sts_replicas(&h, user), 1);

        for tick in 1..=20 {
            let report = h.lifecycle.billing_tick(t0 + hours(tick)).await.unwrap();
            assert_eq!(report.charged, 1, "tick {}", tick);
        }
        assert_eq!(h.store.user(user).lemon_balance, 0);
        assert_eq!(h.store.instance(id).status, InstanceStatus::Running);

        let paused_at = t0 + hours(21);
        let report = h.lifecycle.billing_tick(paused_at).await.unwrap();
        assert_eq!(report.paused, 1);

        let row = h.store.instance(id);
        assert_eq!(row.status, InstanceStatus::Paused);
        assert_eq!(row.paused_at, Some(paused_at));

        // reconciler 한 번으로 replicas 0
        let namespace = names::namespace(&user.to_string());
        let cr = h.cluster.instance(&namespace, "shop").unwrap();
        assert_eq!(cr.state(), Some(InstanceStatus::Paused));
        h.reconciler.reconcile(&cr).await.unwrap();
        assert_eq!(sts_replicas(&h, user), 0);

        // maintain 차감은 10번 (0.5/h x 20h)
        let maintain = h
            .store
            .entries_for(user)
            .iter()
            .filter(|e| e.action == ActionType::InstanceMaintain)
            .count();
        assert_eq!(maintain, 10);
    }

    #[tokio::test]
    async fn test_not_due_instances_are_skipped() {
        let h = setup();
        let user = h.store.add_user(20);
        let (_, t0) = running_small_mongo(&h, user).await;

        let report = h
            .lifecycle
            .billing_tick(t0 + Duration::minutes(59))
            .await
            .unwrap();
        assert_eq!(report, BillingReport::default());
        assert_eq!(h.store.user(user).lemon_balance, 10);
    }

    #[tokio::test]
    async fn test_paused_resumes_after_top_up() {
        let h = setup();
        let user = h.store.add_user(10);
        let (id, t0) = running_small_mongo(&h, user).await;

        h.lifecycle.billing_tick(t0 + hours(1)).await.unwrap();
        assert_eq!(h.store.instance(id).status, InstanceStatus::Paused);

        // 아직 1시간이 안 됐고 잔액도 없음 → 그대로
        let report = h.lifecycle.billing_tick(t0 + hours(1) + Duration::minutes(30)).await.unwrap();
        assert_eq!(report, BillingReport::default());

        h.lifecycle
            .ledger()
            .credit(user, 3, ActionType::Harvest, None)
            .await
            .unwrap();
        let report = h.lifecycle.billing_tick(t0 + hours(2)).await.unwrap();
        assert_eq!(report.resumed, 1);

        let row = h.store.instance(id);
        assert_eq!(row.status, InstanceStatus::Running);
        assert!(row.paused_at.is_none());
        assert_eq!(h.store.user(user).lemon_balance, 2);

        let namespace = names::namespace(&user.to_string());
        let cr = h.cluster.instance(&namespace, "shop").unwrap();
        assert_eq!(cr.state(), Some(InstanceStatus::Running));
    }

    #[tokio::test]
    async fn test_paused_too_long_is_deleted() {
        let h = setup();
        let user = h.store.add_user(10);
        let (id, t0) = running_small_mongo(&h, user).await;

        h.lifecycle.billing_tick(t0 + hours(1)).await.unwrap();
        let report = h.lifecycle.billing_tick(t0 + hours(2)).await.unwrap();
        assert_eq!(report.deleted, 1);

        let row = h.store.instance(id);
        assert_eq!(row.status, InstanceStatus::Deleting);
        assert!(row.deleted_at.is_some());
        assert!(h.store.allocated_ports().is_empty());

        // finalizer 가 있으므로 CR 은 삭제 표시만 된 상태
        let namespace = names::namespace(&user.to_string());
        let cr = h.cluster.instance(&namespace, "shop").unwrap();
        assert!(cr.is_being_deleted());
    }

    #[tokio::test]
    async fn test_stopped_is_neither_billed_nor_deleted() {
        let h = setup();
        let user = h.store.add_user(10);
        let (id, t0) = running_small_mongo(&h, user).await;
        let external_id = h.store.instance(id).external_id;
        h.lifecycle.stop(user, external_id).await.unwrap();

        for tick in 1..=5 {
            let report = h.lifecycle.billing_tick(t0 + hours(tick)).await.unwrap();
            assert_eq!(report, BillingReport::default());
        }
        assert_eq!(h.store.instance(id).status, InstanceStatus::Stopped);
        assert!(h.store.instance(id).deleted_at.is_none());

        let err = assert_err!(h.lifecycle.start(user, external_id).await);
        assert!(matches!(err, ApiError::InsufficientLemons { .. }));
    }

    #[tokio::test]
    async fn test_same_hour_is_charged_once() {
        let h = setup();
        let user = h.store.add_user(20);
        let (id, t0) = running_small_mongo(&h, user).await;
        let row = h.store.instance(id);

        // 같은 스냅샷을 읽은 두 tick
        let now = t0 + hours(1);
        assert_eq!(assert_ok!(h.lifecycle.charge_hour(&row, now).await), 1);
        let err = assert_err!(h.lifecycle.charge_hour(&row, now).await);
        assert!(matches!(err, ApiError::Conflict { .. }));

        assert_eq!(h.store.user(user).lemon_balance, 9);
        let stamped = h.store.instance(id);
        assert_eq!(stamped.last_billed_at, Some(now));
        assert_eq!(stamped.billing_credit, 0.5);
    }

    #[tokio::test]
    async fn test_failed_debit_leaves_billing_stamp() {
        let h = setup();
        let user = h.store.add_user(10);
        let (id, t0) = running_small_mongo(&h, user).await;
        let row = h.store.instance(id);

        let err = assert_err!(h.lifecycle.charge_hour(&row, t0 + hours(1)).await);
        assert!(matches!(err, ApiError::InsufficientLemons { .. }));

        let row = h.store.instance(id);
        assert_eq!(row.last_billed_at, Some(t0));
        assert_eq!(row.billing_credit, 0.0);
    }

    #[tokio::test]
    async fn test_cluster_failure_keeps_row_running() {
        let h = setup();
        let user = h.store.add_user(10);
        let (id, t0) = running_small_mongo(&h, user).await;
        h.cluster.fail_on("shop");

        let report = h.lifecycle.billing_tick(t0 + hours(1)).await.unwrap();
        assert_eq!(report.failed, 1);
        // 차감은 실패했으므로 다음 sweep 에서 다시 시도
        assert_eq!(h.store.instance(id).status, InstanceStatus::Running);
        assert_eq!(h.store.user(user).lemon_balance, 0);

        let namespace = names::namespace(&user.to_string());
        let cr = assert_ok!(h.cluster.get_db_instance(&namespace, "shop").await).unwrap();
        assert_eq!(cr.state(), Some(InstanceStatus::Running));
    }
}

//! Periodic Sweeps
//!
//! 레몬 재생성, 인스턴스 과금, 만료 세션 정리를 각자의 주기로 실행
//!
//! # Interview Q&A
//!
//! Q: sweep 하나가 오래 걸리면?
//! A: tick 마다 30초 데드라인
//!    - 넘기면 그 tick 은 건너뛰고 경고 로그
//!    - 밀린 tick 은 몰아서 실행하지 않음 (`MissedTickBehavior::Skip`)
//!
//! Q: 종료는?
//! A: watch 채널로 모든 루프에 신호 → 진행 중인 tick 이 끝나면 루프 종료

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::db::UserStore;
use crate::error::ApiResult;
use crate::services::{HarvestEngine, InstanceLifecycle};

/// tick 하나의 데드라인
pub const SWEEP_DEADLINE: Duration = Duration::from_secs(30);

#[async_trait]
pub trait Sweep: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run_once(&self, now: DateTime<Utc>) -> ApiResult<()>;
}

// ============ Sweeps ============

pub struct RegrowthSweep(pub Arc<HarvestEngine>);

#[async_trait]
impl Sweep for RegrowthSweep {
    fn name(&self) -> &'static str {
        "regrowth"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> ApiResult<()> {
        self.0.regrow(now).await.map(|_| ())
    }
}

pub struct BillingSweep(pub Arc<InstanceLifecycle>);

#[async_trait]
impl Sweep for BillingSweep {
    fn name(&self) -> &'static str {
        "billing"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> ApiResult<()> {
        self.0.billing_tick(now).await.map(|_| ())
    }
}

pub struct SessionCleanupSweep(pub Arc<dyn UserStore>);

#[async_trait]
impl Sweep for SessionCleanupSweep {
    fn name(&self) -> &'static str {
        "session-cleanup"
    }

    async fn run_once(&self, now: DateTime<Utc>) -> ApiResult<()> {
        let removed = self.0.delete_expired_sessions(now).await?;
        if removed > 0 {
            tracing::info!(removed, "expired sessions removed");
        }
        Ok(())
    }
}

// ============ Scheduler ============

pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
    deadline: Duration,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_deadline(SWEEP_DEADLINE)
    }

    pub fn with_deadline(deadline: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            handles: Vec::new(),
            deadline,
        }
    }

    /// 첫 tick 은 즉시 실행
    pub fn spawn(&mut self, sweep: impl Sweep, period: Duration) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let deadline = self.deadline;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            tracing::info!(sweep = sweep.name(), period_secs = period.as_secs(), "sweep started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match timeout(deadline, sweep.run_once(Utc::now())).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => tracing::warn!(sweep = sweep.name(), error = %e, "sweep failed"),
                            Err(_) => tracing::warn!(
                                sweep = sweep.name(),
                                deadline_secs = deadline.as_secs(),
                                "sweep timed out, skipping tick"
                            ),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::info!(sweep = sweep.name(), "sweep stopped");
        });

        self.handles.push(handle);
    }

    /// 모든 루프에 종료 신호 후 대기
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
        work: Duration,
    }

    #[async_trait]
    impl Sweep for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn run_once(&self, _now: DateTime<Utc>) -> ApiResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(work: Duration) -> (Counting, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));
        (
            Counting {
                runs: runs.clone(),
                finished: finished.clone(),
                work,
            },
            runs,
            finished,
        )
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let (sweep, runs, _) = counting(Duration::ZERO);
        let mut scheduler = Scheduler::new();
        scheduler.spawn(sweep, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(60)).await;
        scheduler.shutdown().await;

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_slow_tick_is_abandoned() {
        let (sweep, runs, finished) = counting(Duration::from_secs(10));
        let mut scheduler = Scheduler::with_deadline(Duration::from_millis(20));
        scheduler.spawn(sweep, Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(130)).await;
        scheduler.shutdown().await;

        assert!(runs.load(Ordering::SeqCst) >= 2);
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}

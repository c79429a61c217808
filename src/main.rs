//! dBtree Control Plane Server
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Client (Frontend)                     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum Web Server                         │
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                      Routes Layer                        ││
//! │  │  /health  /user  /lemon/*  /quiz/*  /db/*               ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Services Layer                        ││
//! │  │  Ledger  HarvestEngine  QuizGate  InstanceLifecycle     ││
//! │  │  Scheduler (regrowth / billing / session cleanup)       ││
//! │  └─────────────────────────────────────────────────────────┘│
//! │  ┌─────────────────────────────────────────────────────────┐│
//! │  │                    Data Layer                            ││
//! │  │  PostgreSQL    Redis / in-memory KV                     ││
//! │  └─────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────┘
//!                              │ DBInstance
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Reconciler (kube-runtime)                    │
//! │  StatefulSet  Service  Secret  ConfigMap  CronJob           │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use kube::CustomResourceExt;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dbtree_control_plane::{
    k8s::{DbInstanceResource, KubeClient},
    kv::{KvStore, MemoryStore, RedisStore},
    reconciler, routes,
    services::{BillingSweep, RegrowthSweep, Scheduler, SessionCleanupSweep},
    types::HarvestRules,
    AppState, Config, Database, HarvestEngine, InstanceLifecycle, Ledger, QuizGate,
};

/// 종료 신호 후 진행 중 요청을 기다리는 최대 시간
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `--print-crd`: kubectl apply 용 CRD 출력
    if std::env::args().any(|arg| arg == "--print-crd") {
        println!("{}", serde_json::to_string_pretty(&DbInstanceResource::crd())?);
        return Ok(());
    }

    // 환경변수 로드
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    // 로깅 초기화
    // RUST_LOG=debug,sqlx=warn 형태로 레벨 제어 가능
    let default_filter = if config.debug_logging {
        "dbtree_control_plane=debug,tower_http=debug"
    } else {
        "dbtree_control_plane=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting dBtree control plane");

    // 데이터베이스 연결
    let db = Arc::new(Database::connect(&config.postgres).await?);
    let applied = db.run_migrations().await?;
    tracing::info!(applied, "database ready");

    // KV 선택
    let kv: Arc<dyn KvStore> = if config.use_local_memory_store {
        tracing::info!("using in-process KV store");
        Arc::new(MemoryStore::new())
    } else {
        tracing::info!("using redis KV store");
        Arc::new(RedisStore::connect(&config.redis_connect_string).await?)
    };

    // 클러스터 연결
    let kube = KubeClient::connect(&config.cluster).await?;
    tracing::info!("kubernetes client ready");

    // 서비스 초기화
    let rules = HarvestRules::default();
    let ledger = Ledger::new(db.clone());
    let harvest = Arc::new(HarvestEngine::new(db.clone(), db.clone(), kv.clone(), rules));
    let quiz = Arc::new(QuizGate::new(
        db.clone(),
        db.clone(),
        kv.clone(),
        rules,
        config.economy.harvest_window,
    ));
    let lifecycle = Arc::new(InstanceLifecycle::new(
        db.clone(),
        db.clone(),
        db.clone(),
        db.clone(),
        ledger.clone(),
        Arc::new(kube.clone()),
        config.cluster.external_host.clone(),
    ));

    harvest.init_tree().await?;

    // 주기 작업
    let mut scheduler = Scheduler::new();
    scheduler.spawn(RegrowthSweep(harvest.clone()), config.economy.regrowth_interval);
    scheduler.spawn(BillingSweep(lifecycle.clone()), config.economy.billing_interval);
    scheduler.spawn(
        SessionCleanupSweep(db.clone()),
        Duration::from_secs(config.session.cleanup_interval_hours.max(1) as u64 * 3600),
    );

    // reconciler
    let reconciler_task = if config.cluster.reconciler_enabled {
        Some(tokio::spawn(reconciler::run(kube.client())))
    } else {
        tracing::info!("reconciler disabled");
        None
    };

    // 앱 상태 구성
    let config = Arc::new(config);
    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        kv,
        users: db,
        ledger,
        harvest,
        quiz,
        lifecycle,
    };

    let app = create_router(state)?;

    // 서버 시작
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    // 신호 → 새 요청 거부 → 스케줄러 정지 → 진행 중 요청 최대 5초 대기
    let server = tokio::spawn(async move { server.await });
    shutdown_signal().await;
    scheduler.shutdown().await;

    match tokio::time::timeout(SHUTDOWN_GRACE, server).await {
        Ok(result) => result??,
        Err(_) => tracing::warn!("in-flight requests did not finish within grace period"),
    }

    if let Some(task) = reconciler_task {
        if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
            tracing::warn!("reconciler did not stop within grace period");
        }
    }

    tracing::info!("shutdown complete");
    Ok(())
}

/// Ctrl-C 또는 SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// 라우터 생성
///
/// # Route Structure
///
/// ```text
/// GET    /health                    - 서버 상태 확인
///
/// GET    /user                      - 프로필 (잔액 포함)
/// DELETE /user                      - 탈퇴
/// POST   /logout                    - 세션 종료
///
/// GET    /lemon/global-status       - 나무 상태
/// GET    /lemon/harvestable         - 수확 가능 여부
/// POST   /lemon/harvest             - 수확
/// GET    /lemon/transactions        - 원장
///
/// GET    /quiz/:positionID          - 퀴즈 시작
/// POST   /quiz/answer               - 답안 제출
///
/// GET    /db/presets                - 프리셋
/// POST   /db/estimate               - 비용 계산
/// POST   /db/instance               - 생성
/// GET    /db/instance               - 목록
/// GET    /db/instance/:id           - 조회
/// DELETE /db/instance/:id           - 삭제
/// POST   /db/instance/:id/{start,stop,restart,backup,restore}
/// GET    /db/instance/:id/backups
/// ```
fn create_router(state: AppState) -> anyhow::Result<Router> {
    let server = &state.config.server;
    let cors_config = &state.config.cors;

    let origins = cors_config
        .allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(cors_config.allow_credentials)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let timeout = TimeoutLayer::new(server.read_timeout + server.write_timeout);

    Ok(Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))

        // User
        .route("/user", get(routes::user::profile).delete(routes::user::delete))
        .route("/logout", post(routes::user::logout))

        // Lemon
        .route("/lemon/global-status", get(routes::lemon::global_status))
        .route("/lemon/harvestable", get(routes::lemon::harvestable))
        .route("/lemon/harvest", post(routes::lemon::harvest))
        .route("/lemon/transactions", get(routes::lemon::transactions))

        // Quiz
        .route("/quiz/answer", post(routes::quiz::answer))
        .route("/quiz/:position_id", get(routes::quiz::start))

        // DB instance
        .route("/db/presets", get(routes::db_instance::list_presets))
        .route("/db/estimate", post(routes::db_instance::estimate_cost))
        .route(
            "/db/instance",
            post(routes::db_instance::create).get(routes::db_instance::list),
        )
        .route(
            "/db/instance/:id",
            get(routes::db_instance::get).delete(routes::db_instance::delete),
        )
        .route("/db/instance/:id/start", post(routes::db_instance::start))
        .route("/db/instance/:id/stop", post(routes::db_instance::stop))
        .route("/db/instance/:id/restart", post(routes::db_instance::restart))
        .route("/db/instance/:id/backup", post(routes::db_instance::backup))
        .route("/db/instance/:id/backups", get(routes::db_instance::list_backups))
        .route("/db/instance/:id/restore", post(routes::db_instance::restore))
        .fallback(routes::fallback)

        // 미들웨어
        .layer(timeout)
        .layer(TraceLayer::new_for_http())
        .layer(cors)

        // 상태 주입
        .with_state(state))
}

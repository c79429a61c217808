//! Health Check Endpoint
//!
//! # Interview Q&A
//!
//! Q: Health check 엔드포인트는 왜 필요한가?
//! A: 3가지 용도
//!    1. 로드밸런서 헬스체크
//!    2. Kubernetes liveness/readiness probe
//!    3. 모니터링 시스템 연동
//!
//! Q: DB 와 KV 를 모두 체크하는 이유는?
//! A: "깊은 헬스체크"(deep health check) 패턴
//!    - PostgreSQL: 원장, 인스턴스
//!    - KV: 퀴즈 진행/통과 상태 (없으면 수확 불가)

use std::future::Future;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

/// Health check 응답
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: DependencyStatus,
    pub kv: DependencyStatus,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct DependencyStatus {
    pub connected: bool,
    pub latency_ms: Option<u64>,
}

async fn probe<E>(check: impl Future<Output = Result<(), E>>) -> DependencyStatus {
    let start = Instant::now();
    match check.await {
        Ok(()) => DependencyStatus {
            connected: true,
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Err(_) => DependencyStatus {
            connected: false,
            latency_ms: None,
        },
    }
}

/// GET /health
///
/// 하나라도 끊기면 503 + "degraded"
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let database = probe(state.db.health_check()).await;
    let kv = probe(state.kv.ping()).await;

    let healthy = database.connected && kv.connected;
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(HealthResponse {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database,
            kv,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }),
    )
}

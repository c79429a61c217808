//! DB Instance Endpoints
//!
//! # Route Structure
//!
//! ```text
//! GET    /db/presets                  - 엔진별 프리셋
//! POST   /db/estimate                 - 커스텀 스펙 비용 계산
//! POST   /db/instance                 - 생성 (레몬 차감)
//! GET    /db/instance                 - 목록
//! GET    /db/instance/:id             - 조회
//! DELETE /db/instance/:id             - 삭제
//! POST   /db/instance/:id/start       - paused/stopped → running
//! POST   /db/instance/:id/stop        - running → stopped
//! POST   /db/instance/:id/restart
//! POST   /db/instance/:id/backup      - 수동 백업
//! GET    /db/instance/:id/backups
//! POST   /db/instance/:id/restore     - { "backupId": "..." }
//! ```

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::auth::AuthUser;
use crate::error::ApiError;
use crate::types::{
    BackupRecord, CreateInstanceRequest, CreateInstanceResponse, EstimateCostRequest,
    EstimateCostResponse, InstanceResponse, ListPresetsResponse, RestoreResponse,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub backup_id: Uuid,
}

// ============ Catalog ============

pub async fn list_presets(State(state): State<AppState>) -> Result<Json<ListPresetsResponse>, ApiError> {
    Ok(Json(state.lifecycle.list_presets().await?))
}

pub async fn estimate_cost(
    State(state): State<AppState>,
    Json(req): Json<EstimateCostRequest>,
) -> Result<Json<EstimateCostResponse>, ApiError> {
    Ok(Json(state.lifecycle.estimate_cost(req).await?))
}

// ============ Instances ============

/// POST /db/instance
///
/// 비밀번호는 이 응답에서만 한 번 노출
pub async fn create(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateInstanceRequest>,
) -> Result<(StatusCode, Json<CreateInstanceResponse>), ApiError> {
    let created = state.lifecycle.create(user.id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn list(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Vec<InstanceResponse>>, ApiError> {
    Ok(Json(state.lifecycle.list(user.id).await?))
}

pub async fn get(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.lifecycle.get(user.id, id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.lifecycle.delete(user.id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Control ============

pub async fn start(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.lifecycle.start(user.id, id).await?))
}

pub async fn stop(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.lifecycle.stop(user.id, id).await?))
}

pub async fn restart(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<InstanceResponse>, ApiError> {
    Ok(Json(state.lifecycle.restart(user.id, id).await?))
}

// ============ Backup ============

pub async fn backup(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<BackupRecord>), ApiError> {
    let record = state.lifecycle.backup(user.id, id).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

pub async fn list_backups(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<BackupRecord>>, ApiError> {
    Ok(Json(state.lifecycle.list_backups(user.id, id).await?))
}

pub async fn restore(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RestoreRequest>,
) -> Result<(StatusCode, Json<RestoreResponse>), ApiError> {
    let restored = state.lifecycle.restore(user.id, id, req.backup_id).await?;
    Ok((StatusCode::ACCEPTED, Json(restored)))
}

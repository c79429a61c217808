//! Lemon Endpoints
//!
//! 나무 상태 조회, 수확 가능 여부, 수확, 원장 조회

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use super::auth::AuthUser;
use crate::error::ApiError;
use crate::services::TransactionPage;
use crate::types::{HarvestEligibility, HarvestOutcome, PageQuery, TreeStatus};
use crate::AppState;

// ============ Request Types ============

#[derive(Debug, Deserialize)]
pub struct HarvestRequest {
    #[serde(rename = "positionID")]
    pub position_id: i32,
    #[serde(rename = "attemptID", default)]
    pub attempt_id: Option<i64>,
}

// ============ Handlers ============

/// GET /lemon/global-status
///
/// ```json
/// { "availablePositions": [0, 3, 7], "totalHarvested": 120, "nextRegrowthTime": "..." }
/// ```
pub async fn global_status(State(state): State<AppState>) -> Result<Json<TreeStatus>, ApiError> {
    Ok(Json(state.harvest.tree_status().await?))
}

/// GET /lemon/harvestable
pub async fn harvestable(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Json<HarvestEligibility> {
    Json(state.harvest.can_harvest(&user))
}

/// POST /lemon/harvest
///
/// 퀴즈 통과 기록이 있어야 성공 (한 번 소비)
pub async fn harvest(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<HarvestRequest>,
) -> Result<Json<HarvestOutcome>, ApiError> {
    let outcome = state.harvest.harvest(&user, req.position_id, req.attempt_id).await?;
    Ok(Json(outcome))
}

/// GET /lemon/transactions?page=0&limit=20
pub async fn transactions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(page): Query<PageQuery>,
) -> Result<Json<TransactionPage>, ApiError> {
    Ok(Json(state.ledger.list_transactions(user.id, page).await?))
}

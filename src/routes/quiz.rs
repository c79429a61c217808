//! Quiz Endpoints

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::auth::AuthUser;
use crate::error::ApiError;
use crate::types::{QuizStartResponse, SubmitAnswerResponse};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub option_idx: i32,
}

/// GET /quiz/:positionID
///
/// 위치의 퀴즈 시작 (사용자당 동시에 하나)
pub async fn start(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(position_id): Path<i32>,
) -> Result<Json<QuizStartResponse>, ApiError> {
    Ok(Json(state.quiz.start(&user, position_id).await?))
}

/// POST /quiz/answer
///
/// ```json
/// { "option_idx": 2 }
/// ```
pub async fn answer(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<AnswerRequest>,
) -> Result<Json<SubmitAnswerResponse>, ApiError> {
    Ok(Json(state.quiz.submit(&user, req.option_idx).await?))
}

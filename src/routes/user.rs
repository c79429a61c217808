//! User Endpoints
//!
//! 프로필, 탈퇴, 로그아웃 (OTP 발급/검증은 인증 협력자 담당)

use axum::{extract::State, http::HeaderMap, http::StatusCode, Json};
use chrono::Utc;

use super::auth::{bearer_token, hash_token, AuthUser};
use crate::error::ApiError;
use crate::types::User;
use crate::AppState;

/// GET /user
pub async fn profile(AuthUser(user): AuthUser) -> Json<User> {
    Json(user)
}

/// DELETE /user
///
/// 남은 인스턴스를 먼저 정리한 뒤 soft delete (이메일은 tombstone 으로 교체)
pub async fn delete(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<StatusCode, ApiError> {
    for instance in state.lifecycle.list(user.id).await? {
        if let Err(e) = state.lifecycle.delete(user.id, instance.id).await {
            tracing::warn!(user_id = %user.id, instance_id = %instance.id, error = %e, "instance cleanup failed");
        }
    }

    state.users.soft_delete_user(user.id, Utc::now()).await?;
    tracing::info!(user_id = %user.id, "user deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// POST /logout
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = bearer_token(&headers)?;
    state.users.delete_session(&hash_token(token)).await?;
    Ok(StatusCode::NO_CONTENT)
}

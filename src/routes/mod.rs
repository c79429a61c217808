//! API Routes Module
//!
//! 모든 HTTP 엔드포인트 정의
//!
//! # Routes
//! - `/health` - 헬스 체크
//! - `/user`, `/logout` - 프로필, 탈퇴, 로그아웃
//! - `/lemon/*` - 나무 상태, 수확, 원장
//! - `/quiz/*` - 퀴즈 시작, 답안 제출
//! - `/db/*` - 프리셋, 비용 계산, 인스턴스 생명주기

pub mod auth;
pub mod db_instance;
pub mod health;
pub mod lemon;
pub mod quiz;
pub mod user;

use axum::http::Uri;

use crate::error::ApiError;

/// 매칭되는 라우트가 없을 때
pub async fn fallback(uri: Uri) -> ApiError {
    tracing::debug!(path = %uri.path(), "endpoint not found");
    ApiError::EndpointNotFound
}

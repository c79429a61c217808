//! Bearer Session Authentication
//!
//! # Interview Q&A
//!
//! Q: 세션 토큰을 그대로 DB 에 저장하지 않는 이유는?
//! A: DB 가 유출돼도 토큰으로 로그인할 수 없도록 SHA3-256 해시만 저장
//!    - 요청마다 헤더 토큰을 해시해서 조회
//!
//! Q: 인증 실패 코드 구분은?
//! A: 헤더 없음 → unauthorized, 형식 오류 → invalid_token, 조회 실패/만료 → session_not_found

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use chrono::Utc;
use sha3::{Digest, Sha3_256};

use crate::error::{ApiError, ApiResult};
use crate::types::User;
use crate::AppState;

/// 인증된 사용자
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let user = state
            .users
            .user_by_session(&hash_token(token), Utc::now())
            .await?
            .ok_or(ApiError::SessionNotFound)?;
        Ok(AuthUser(user))
    }
}

/// `Authorization: Bearer {token}` 에서 토큰 추출
pub fn bearer_token(headers: &HeaderMap) -> ApiResult<&str> {
    let value = headers.get(AUTHORIZATION).ok_or(ApiError::Unauthorized)?;
    let value = value.to_str().map_err(|_| ApiError::InvalidToken)?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(ApiError::InvalidToken),
    }
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha3_256::digest(token.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc123")).unwrap(), "abc123");
        assert_eq!(bearer_token(&headers("bearer  abc123")).unwrap(), "abc123");

        assert!(matches!(bearer_token(&HeaderMap::new()), Err(ApiError::Unauthorized)));
        assert!(matches!(bearer_token(&headers("Basic abc")), Err(ApiError::InvalidToken)));
        assert!(matches!(bearer_token(&headers("Bearer ")), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_hash_token() {
        let hash = hash_token("abc123");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("abc123"));
        assert_ne!(hash, hash_token("abc124"));
    }
}

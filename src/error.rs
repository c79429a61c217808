//! Error Handling Module
//!
//! Provides type-safe error handling with a stable numeric code namespace and
//! HTTP status code mapping. Uses thiserror for domain errors and integrates
//! with tracing for structured logging.
//!
//! # Design Decision
//!
//! 클라이언트는 숫자 코드(1000~1xxx)로 로직을 분기하고, HTTP 상태 코드는 전송용
//! - 코드 namespace 는 고정 (절대 재사용 금지)
//! - 도메인 에러는 계층을 지나도 그대로 전파
//! - 분류되지 않은 에러만 Internal 로 승격 (승격 지점 기록)

use std::panic::Location;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// 안정적인 에러 코드 namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 1000,
    Internal = 1001,

    InvalidParameter = 1100,
    MissingParameter = 1101,
    MethodNotAllowed = 1102,
    EndpointNotFound = 1103,

    InvalidOtp = 1200,
    ExpiredOtp = 1201,
    SessionNotFound = 1202,
    TooManyResends = 1203,
    TooEarlyResend = 1204,
    InvalidToken = 1205,
    Unauthorized = 1206,
    SessionExpired = 1207,
    AlreadyVerified = 1208,

    InvalidEmail = 1301,

    ResourceNotFound = 1400,
    ResourceConflict = 1401,
    LimitExceeded = 1402,
    PortExhausted = 1403,

    HarvestCooldown = 1500,
    StorageFull = 1501,
    InsufficientLemons = 1502,

    QuizInProgress = 1600,
    NoQuizPassed = 1601,
    HarvestAlreadyProcessed = 1602,
    QuizTimeExpired = 1603,
    ClickTimeExpired = 1604,
    NoQuizInProgress = 1605,
    AlreadyHarvested = 1606,

    InvalidStatusTransition = 1700,
    InstanceQuotaExceeded = 1701,
    InvalidInstanceName = 1702,
    InvalidResourceSpec = 1703,
    InstanceNotReady = 1704,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// 로그/클라이언트용 snake_case 이름
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::Internal => "internal",
            ErrorCode::InvalidParameter => "invalid_parameter",
            ErrorCode::MissingParameter => "missing_parameter",
            ErrorCode::MethodNotAllowed => "method_not_allowed",
            ErrorCode::EndpointNotFound => "endpoint_not_found",
            ErrorCode::InvalidOtp => "invalid_otp",
            ErrorCode::ExpiredOtp => "expired_otp",
            ErrorCode::SessionNotFound => "session_not_found",
            ErrorCode::TooManyResends => "too_many_resends",
            ErrorCode::TooEarlyResend => "too_early_resend",
            ErrorCode::InvalidToken => "invalid_token",
            ErrorCode::Unauthorized => "unauthorized",
            ErrorCode::SessionExpired => "session_expired",
            ErrorCode::AlreadyVerified => "already_verified",
            ErrorCode::InvalidEmail => "invalid_email",
            ErrorCode::ResourceNotFound => "resource_not_found",
            ErrorCode::ResourceConflict => "resource_conflict",
            ErrorCode::LimitExceeded => "limit_exceeded",
            ErrorCode::PortExhausted => "port_exhausted",
            ErrorCode::HarvestCooldown => "harvest_cooldown",
            ErrorCode::StorageFull => "storage_full",
            ErrorCode::InsufficientLemons => "insufficient_lemons",
            ErrorCode::QuizInProgress => "quiz_in_progress",
            ErrorCode::NoQuizPassed => "no_quiz_passed",
            ErrorCode::HarvestAlreadyProcessed => "harvest_already_processed",
            ErrorCode::QuizTimeExpired => "quiz_time_expired",
            ErrorCode::ClickTimeExpired => "click_time_expired",
            ErrorCode::NoQuizInProgress => "no_quiz_in_progress",
            ErrorCode::AlreadyHarvested => "already_harvested",
            ErrorCode::InvalidStatusTransition => "invalid_status_transition",
            ErrorCode::InstanceQuotaExceeded => "instance_quota_exceeded",
            ErrorCode::InvalidInstanceName => "invalid_instance_name",
            ErrorCode::InvalidResourceSpec => "invalid_resource_spec",
            ErrorCode::InstanceNotReady => "instance_not_ready",
        }
    }
}

/// API 에러 타입
///
/// # Design Decision
///
/// 각 에러 variant는 고정된 숫자 코드 + HTTP 상태 코드에 매핑됨
/// - 클라이언트 에러: 4xx (잘못된 요청, 인증 실패, 충돌 등)
/// - 서버 에러: 5xx (내부 오류)
///
/// 민감한 내부 정보는 클라이언트에 노출하지 않음
#[derive(Debug, Error)]
pub enum ApiError {
    // ============ 400 Bad Request ============
    #[error("invalid parameter {parameter}: {reason}")]
    InvalidParameter { parameter: String, reason: String },

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("invalid email: {0}")]
    InvalidEmail(String),

    #[error("invalid instance name: {0}")]
    InvalidInstanceName(String),

    #[error("invalid resource spec: {0}")]
    InvalidResourceSpec(String),

    // ============ 401 Unauthorized ============
    #[error("invalid otp")]
    InvalidOtp,

    #[error("otp expired")]
    ExpiredOtp,

    #[error("session not found")]
    SessionNotFound,

    #[error("invalid token")]
    InvalidToken,

    #[error("authentication required")]
    Unauthorized,

    #[error("session expired")]
    SessionExpired,

    // ============ 404 Not Found ============
    #[error("{resource} not found: {id}")]
    NotFound { resource: String, id: String },

    #[error("endpoint not found")]
    EndpointNotFound,

    // ============ 405 Method Not Allowed ============
    #[error("method not allowed")]
    MethodNotAllowed,

    // ============ 409 Conflict ============
    #[error("{resource} conflict: {detail}")]
    Conflict { resource: String, detail: String },

    #[error("instance name already in use: {0}")]
    InstanceNameConflict(String),

    #[error("instance limit exceeded: max {max}")]
    LimitExceeded { max: i64 },

    #[error("no free node port")]
    PortExhausted,

    #[error("harvest cooldown: wait {wait_seconds}s")]
    HarvestCooldown { wait_seconds: i64 },

    #[error("lemon storage full (max {max_lemons})")]
    StorageFull { max_lemons: i64 },

    #[error("insufficient lemons: required {required}, missing {missing}")]
    InsufficientLemons { required: f64, missing: f64 },

    #[error("email already verified")]
    AlreadyVerified,

    #[error("lemon already harvested")]
    AlreadyHarvested,

    #[error("quiz already in progress")]
    QuizInProgress,

    #[error("no quiz in progress")]
    NoQuizInProgress,

    #[error("no passed quiz for this position")]
    NoQuizPassed,

    #[error("harvest already processed")]
    HarvestAlreadyProcessed,

    #[error("quiz time expired")]
    QuizTimeExpired,

    #[error("harvest window expired")]
    ClickTimeExpired,

    #[error("invalid status transition {current} -> {target}")]
    InvalidStatusTransition { current: String, target: String },

    #[error("instance not ready: {0}")]
    InstanceNotReady(String),

    // ============ 429 Too Many Requests ============
    #[error("too many resend requests")]
    TooManyResends,

    #[error("resend requested too early: wait {wait_seconds}s")]
    TooEarlyResend { wait_seconds: i64 },

    // ============ 500 Internal Server Error ============
    #[error("internal error at {location}: {source:#}")]
    Internal {
        source: anyhow::Error,
        location: &'static Location<'static>,
    },
}

/// API 에러 응답 구조
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiError {
    /// 분류되지 않은 에러를 Internal 로 승격
    ///
    /// 이미 ApiError 인 경우 그대로 반환 (코드 보존)
    #[track_caller]
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        match err.downcast::<ApiError>() {
            Ok(api_err) => api_err,
            Err(source) => ApiError::Internal {
                source,
                location: Location::caller(),
            },
        }
    }

    pub fn not_found(resource: &str, id: impl ToString) -> Self {
        ApiError::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn invalid_param(parameter: &str, reason: impl Into<String>) -> Self {
        ApiError::InvalidParameter {
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }

    pub fn insufficient(required: f64, balance: i64) -> Self {
        ApiError::InsufficientLemons {
            required,
            missing: (required - balance as f64).max(0.0),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ApiError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            ApiError::MissingParameter(_) => ErrorCode::MissingParameter,
            ApiError::InvalidEmail(_) => ErrorCode::InvalidEmail,
            ApiError::InvalidInstanceName(_) => ErrorCode::InvalidInstanceName,
            ApiError::InvalidResourceSpec(_) => ErrorCode::InvalidResourceSpec,
            ApiError::InvalidOtp => ErrorCode::InvalidOtp,
            ApiError::ExpiredOtp => ErrorCode::ExpiredOtp,
            ApiError::SessionNotFound => ErrorCode::SessionNotFound,
            ApiError::InvalidToken => ErrorCode::InvalidToken,
            ApiError::Unauthorized => ErrorCode::Unauthorized,
            ApiError::SessionExpired => ErrorCode::SessionExpired,
            ApiError::NotFound { .. } => ErrorCode::ResourceNotFound,
            ApiError::EndpointNotFound => ErrorCode::EndpointNotFound,
            ApiError::MethodNotAllowed => ErrorCode::MethodNotAllowed,
            ApiError::Conflict { .. } => ErrorCode::ResourceConflict,
            ApiError::InstanceNameConflict(_) => ErrorCode::ResourceConflict,
            ApiError::LimitExceeded { .. } => ErrorCode::LimitExceeded,
            ApiError::PortExhausted => ErrorCode::PortExhausted,
            ApiError::HarvestCooldown { .. } => ErrorCode::HarvestCooldown,
            ApiError::StorageFull { .. } => ErrorCode::StorageFull,
            ApiError::InsufficientLemons { .. } => ErrorCode::InsufficientLemons,
            ApiError::AlreadyVerified => ErrorCode::AlreadyVerified,
            ApiError::AlreadyHarvested => ErrorCode::AlreadyHarvested,
            ApiError::QuizInProgress => ErrorCode::QuizInProgress,
            ApiError::NoQuizInProgress => ErrorCode::NoQuizInProgress,
            ApiError::NoQuizPassed => ErrorCode::NoQuizPassed,
            ApiError::HarvestAlreadyProcessed => ErrorCode::HarvestAlreadyProcessed,
            ApiError::QuizTimeExpired => ErrorCode::QuizTimeExpired,
            ApiError::ClickTimeExpired => ErrorCode::ClickTimeExpired,
            ApiError::InvalidStatusTransition { .. } => ErrorCode::InvalidStatusTransition,
            ApiError::InstanceNotReady(_) => ErrorCode::InstanceNotReady,
            ApiError::TooManyResends => ErrorCode::TooManyResends,
            ApiError::TooEarlyResend { .. } => ErrorCode::TooEarlyResend,
            ApiError::Internal { .. } => ErrorCode::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidParameter { .. }
            | ApiError::MissingParameter(_)
            | ApiError::InvalidEmail(_)
            | ApiError::InvalidInstanceName(_)
            | ApiError::InvalidResourceSpec(_) => StatusCode::BAD_REQUEST,

            ApiError::InvalidOtp
            | ApiError::ExpiredOtp
            | ApiError::SessionNotFound
            | ApiError::InvalidToken
            | ApiError::Unauthorized
            | ApiError::SessionExpired => StatusCode::UNAUTHORIZED,

            ApiError::NotFound { .. } | ApiError::EndpointNotFound => StatusCode::NOT_FOUND,

            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,

            ApiError::TooManyResends | ApiError::TooEarlyResend { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 충돌/쿨다운/잔액/퀴즈 상태 오류
            _ => StatusCode::CONFLICT,
        }
    }

    /// 응답 data payload
    pub fn data(&self) -> Option<Value> {
        match self {
            ApiError::InvalidParameter { parameter, .. } => Some(json!({ "parameter": parameter })),
            ApiError::MissingParameter(parameter) => Some(json!({ "parameter": parameter })),
            ApiError::NotFound { resource, id } => Some(json!({ "resource": resource, "id": id })),
            ApiError::InstanceNameConflict(name) => Some(json!({ "name": name })),
            ApiError::LimitExceeded { max } => Some(json!({ "max": max })),
            ApiError::HarvestCooldown { wait_seconds } => Some(json!({ "waitSeconds": wait_seconds })),
            ApiError::TooEarlyResend { wait_seconds } => Some(json!({ "waitSeconds": wait_seconds })),
            ApiError::StorageFull { max_lemons } => Some(json!({ "maxLemons": max_lemons })),
            ApiError::InsufficientLemons { required, missing } => {
                Some(json!({ "required": required, "missing": missing }))
            }
            ApiError::InvalidStatusTransition { current, target } => {
                Some(json!({ "current": current, "target": target }))
            }
            _ => None,
        }
    }

    /// 재시도 가능한 에러의 Retry-After (초)
    pub fn retry_after(&self) -> Option<i64> {
        match self {
            ApiError::HarvestCooldown { wait_seconds }
            | ApiError::TooEarlyResend { wait_seconds } => Some((*wait_seconds).max(1)),
            _ => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, ApiError::Internal { .. })
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let message = match &self {
            ApiError::Internal { source, location } => {
                // 내부 에러는 클라이언트에 상세 정보 노출 안 함
                tracing::error!(%location, error = ?source, "internal error");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorResponse {
            code: code.as_u16(),
            message,
            data: self.data(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// SQLx 에러를 ApiError로 변환
impl From<sqlx::Error> for ApiError {
    #[track_caller]
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal {
            source: err.into(),
            location: Location::caller(),
        }
    }
}

impl From<redis::RedisError> for ApiError {
    #[track_caller]
    fn from(err: redis::RedisError) -> Self {
        ApiError::Internal {
            source: err.into(),
            location: Location::caller(),
        }
    }
}

impl From<kube::Error> for ApiError {
    #[track_caller]
    fn from(err: kube::Error) -> Self {
        ApiError::Internal {
            source: err.into(),
            location: Location::caller(),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal {
            source: err.into(),
            location: Location::caller(),
        }
    }
}

/// anyhow 에러를 ApiError로 변환
impl From<anyhow::Error> for ApiError {
    #[track_caller]
    fn from(err: anyhow::Error) -> Self {
        ApiError::internal(err)
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::InsufficientLemons.as_u16(), 1502);
        assert_eq!(ErrorCode::AlreadyHarvested.as_u16(), 1606);
        assert_eq!(ErrorCode::InvalidStatusTransition.as_u16(), 1700);
        assert_eq!(ApiError::PortExhausted.code().name(), "port_exhausted");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::invalid_param("name", "too short").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::not_found("instance", "x").status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::AlreadyHarvested.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::QuizInProgress.status(), StatusCode::CONFLICT);
        assert_eq!(ApiError::TooManyResends.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            ApiError::internal(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_keeps_domain_error() {
        let wrapped = anyhow::Error::new(ApiError::StorageFull { max_lemons: 500 });
        let err = ApiError::internal(wrapped);
        assert_eq!(err.code(), ErrorCode::StorageFull);
    }

    #[test]
    fn test_cooldown_response_has_retry_after() {
        let response = ApiError::HarvestCooldown { wait_seconds: 120 }.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("120")
        );
    }

    #[test]
    fn test_insufficient_data_payload() {
        let err = ApiError::insufficient(20.0, 12);
        assert_eq!(err.data(), Some(json!({ "required": 20.0, "missing": 8.0 })));
    }
}

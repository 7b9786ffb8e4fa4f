//! HTTP 错误映射
//!
//! `PeekError` -> 状态码 + `{ "error": CODE, "message": text }` 响应体。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use pk_core::PeekError;

/// API 错误
#[derive(Debug, Error)]
pub enum ApiError {
    /// 查询参数不合法
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// 请求体不是合法的 JSON 对象
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// 模板或高亮规则求值失败，事件未提交
    #[error("template error: {0}")]
    Template(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownStream(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidPayload(_) | Self::Template(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::UnknownStream(_) => "UNKNOWN_STREAM",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidPayload(_) => "INVALID_PAYLOAD",
            Self::Template(_) => "TEMPLATE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }
}

impl From<PeekError> for ApiError {
    fn from(err: PeekError) -> Self {
        match err {
            PeekError::UnknownStream(slug) => Self::UnknownStream(slug),
            err @ PeekError::NotFound { .. } => Self::NotFound(err.to_string()),
            PeekError::InvalidPayload(msg) => Self::InvalidPayload(msg),
            PeekError::Template(msg) => Self::Template(msg),
            // 请求体在路由层解析，这里的序列化错误都来自服务端
            err @ (PeekError::Persistence(_)
            | PeekError::Config(_)
            | PeekError::Io(_)
            | PeekError::Serialization(_)) => Self::Internal(err.to_string()),
        }
    }
}

/// 错误响应体
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(error_code = body.error, error_message = %body.message, "API error");
        } else {
            tracing::warn!(error_code = body.error, error_message = %body.message, "API error");
        }

        (status, Json(body)).into_response()
    }
}

/// Handler 统一返回类型
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (PeekError::UnknownStream("x".into()), StatusCode::NOT_FOUND),
            (PeekError::not_found("x", "1"), StatusCode::NOT_FOUND),
            (PeekError::Template("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (PeekError::InvalidPayload("bad".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (PeekError::Persistence("disk".into()), StatusCode::INTERNAL_SERVER_ERROR),
            (
                PeekError::from(serde_json::from_str::<serde_json::Value>("{").unwrap_err()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }
}

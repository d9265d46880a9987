//! 统一错误处理
//!
//! 所有流水线阶段都返回 `DeployError`，边界层按类型映射为 HTTP 状态码。
//! `Internal` 的细节只写日志，不返回给客户端。

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::domain::deploy::DeployEvent;

/// API 错误响应结构
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// 部署错误
#[derive(Debug, Error)]
pub enum DeployError {
    /// 400 - 请求或清单无效
    #[error("invalid request: {0}")]
    Validation(String),
    /// 413 - 上传超过大小上限
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    /// 401 - 缺少或无效的令牌
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// 403 - 令牌有效但无法映射到命名空间
    #[error("forbidden: {0}")]
    Forbidden(String),
    /// 404 - 资源不存在或不可见
    #[error("{0}")]
    NotFound(String),
    /// 409 - 版本已注册
    #[error("conflict: {0}")]
    Conflict(String),
    /// 502 - 外部构建失败，附带日志尾部
    #[error("build failed: {message}")]
    Build {
        message: String,
        log_tail: Vec<String>,
    },
    /// 500 - 集群拒绝描述文件
    #[error("apply failed: {0}")]
    Apply(String),
    /// 500 - I/O 或存储故障
    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn too_large(message: impl Into<String>) -> Self {
        Self::PayloadTooLarge(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// 引用不存在或对请求方不可见，两种情况返回同一条消息
    pub fn not_available(reference: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} not found or not available", reference))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn build(message: impl Into<String>, log_tail: Vec<String>) -> Self {
        Self::Build {
            message: message.into(),
            log_tail,
        }
    }

    pub fn apply(message: impl Into<String>) -> Self {
        Self::Apply(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// HTTP 状态码
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Build { .. } => StatusCode::BAD_GATEWAY,
            Self::Apply(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 错误类型标识
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Build { .. } => "build_error",
            Self::Apply(_) => "apply_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// 返回给客户端的消息
    pub fn public_message(&self) -> String {
        match self {
            Self::Internal(_) => "Internal server error".to_string(),
            Self::Apply(_) => "Cluster rejected the deployment descriptor".to_string(),
            Self::Build { message, .. } => message.clone(),
            Self::Validation(m)
            | Self::PayloadTooLarge(m)
            | Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m) => m.clone(),
        }
    }

    /// 构建失败时的日志尾部
    pub fn log_tail(&self) -> Option<&[String]> {
        match self {
            Self::Build { log_tail, .. } if !log_tail.is_empty() => Some(log_tail),
            _ => None,
        }
    }

    /// 转换为事件流中的终止事件
    pub fn to_event(&self) -> DeployEvent {
        DeployEvent::Error {
            status: self.status().as_u16(),
            error: self.kind().to_string(),
            message: self.public_message(),
            log_tail: self.log_tail().map(<[String]>::to_vec),
        }
    }
}

impl From<std::io::Error> for DeployError {
    fn from(e: std::io::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl IntoResponse for DeployError {
    fn into_response(self) -> Response {
        if let Self::Internal(detail) = &self {
            tracing::error!(error = %detail, "Internal error");
        }

        let mut body = ErrorResponse::new(self.kind(), self.public_message());
        if let Some(tail) = self.log_tail() {
            body = body.with_details(tail.join("\n"));
        }
        (self.status(), Json(body)).into_response()
    }
}

/// 便捷类型别名
pub type DeployResult<T> = Result<T, DeployError>;

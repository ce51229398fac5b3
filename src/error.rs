//! 错误类型
//!
//! 所有远端调用的失败都在调用边界处被映射为唯一一种错误类别，
//! 并附带操作名与结构化元数据；原始消息始终保留。

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Debug, Error)]
pub enum AppError {
    /// 代码托管 API 错误
    #[error("托管API错误: {0}")]
    RemoteApi(#[from] RemoteApiError),
    /// 补全 API 错误
    #[error("补全API错误: {0}")]
    CompletionApi(#[from] CompletionApiError),
    /// 校验错误（例如不支持的语言代码）
    #[error("校验错误: {0}")]
    Validation(String),
    /// 本地存储错误
    #[error("存储错误 ({operation}): {source}")]
    Storage {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },
    /// 限流器自身的错误（服务未注册、队列被清空等）
    #[error("限流器错误: {0}")]
    RateLimiter(#[from] RateLimiterError),
    /// 收到终止信号，尚未完成的步骤被放弃
    #[error("已取消: {0}")]
    Cancelled(String),
    /// 其他错误
    #[error("未知错误: {0}")]
    Unknown(String),
}

/// 托管 API 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteApiKind {
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ServerError,
    /// 其余 4xx（例如 422）
    Rejected,
}

/// 托管 API 错误
#[derive(Debug, Clone, Error)]
#[error("{operation} 失败 [{kind:?}] (status={status:?}, request_id={request_id:?}): {message}")]
pub struct RemoteApiError {
    pub kind: RemoteApiKind,
    pub operation: String,
    pub status: Option<u16>,
    pub request_id: Option<String>,
    pub message: String,
}

impl RemoteApiError {
    /// 根据状态码和消息文本归类
    ///
    /// 部分服务只在消息文本里说明限流，所以 403 也要检查文本。
    pub fn classify(
        operation: impl Into<String>,
        status: Option<u16>,
        request_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        let message = message.into();
        let kind = match status {
            Some(429) => RemoteApiKind::RateLimited,
            Some(403) if mentions_rate_limit(&message) => RemoteApiKind::RateLimited,
            Some(401) => RemoteApiKind::Unauthorized,
            Some(403) => RemoteApiKind::Forbidden,
            Some(404) => RemoteApiKind::NotFound,
            Some(s) if s >= 500 => RemoteApiKind::ServerError,
            Some(_) => RemoteApiKind::Rejected,
            None if mentions_rate_limit(&message) => RemoteApiKind::RateLimited,
            None => RemoteApiKind::ServerError,
        };
        Self {
            kind,
            operation: operation.into(),
            status,
            request_id,
            message,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == RemoteApiKind::NotFound
    }
}

/// 补全 API 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionApiKind {
    RateLimited,
    BadRequest,
    ServerError,
}

/// 补全 API 错误
#[derive(Debug, Clone, Error)]
#[error("{operation} 失败 [{kind:?}] (status={status:?}): {message}")]
pub struct CompletionApiError {
    pub kind: CompletionApiKind,
    pub operation: String,
    pub status: Option<u16>,
    pub message: String,
}

impl CompletionApiError {
    pub fn classify(operation: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match status {
            Some(429) => CompletionApiKind::RateLimited,
            _ if mentions_rate_limit(&message) => CompletionApiKind::RateLimited,
            Some(s) if (400..500).contains(&s) => CompletionApiKind::BadRequest,
            Some(_) => CompletionApiKind::ServerError,
            None if mentions_bad_request(&message) => CompletionApiKind::BadRequest,
            None => CompletionApiKind::ServerError,
        };
        Self {
            kind,
            operation: operation.into(),
            status,
            message,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == CompletionApiKind::RateLimited
    }
}

/// 限流器错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimiterError {
    #[error("服务 {0} 已注册")]
    AlreadyRegistered(String),
    #[error("服务 {service} 配置无效: {reason}")]
    InvalidConfig { service: String, reason: String },
    #[error("服务 {0} 未注册")]
    UnknownService(String),
    #[error("限流器已关闭")]
    ShutDown,
    #[error("服务 {0} 的排队任务已被丢弃")]
    Dropped(String),
    #[error("服务 {service} 队列已满 (上限 {high_water})")]
    QueueFull { service: String, high_water: usize },
}

fn mentions_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("ratelimit")
        || lower.contains("too many requests")
}

fn mentions_bad_request(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("invalid_request") || lower.contains("bad request")
}

impl AppError {
    /// 错误类别名（用于结构化日志和持久化）
    pub fn kind(&self) -> String {
        match self {
            AppError::RemoteApi(e) => format!("remote_api.{}", snake(&format!("{:?}", e.kind))),
            AppError::CompletionApi(e) => format!("completion_api.{}", snake(&format!("{:?}", e.kind))),
            AppError::Validation(_) => "validation".to_string(),
            AppError::Storage { .. } => "storage".to_string(),
            AppError::RateLimiter(_) => "rate_limiter".to_string(),
            AppError::Cancelled(_) => "cancelled".to_string(),
            AppError::Unknown(_) => "unknown".to_string(),
        }
    }

    /// 出错的操作名
    pub fn operation(&self) -> Option<&str> {
        match self {
            AppError::RemoteApi(e) => Some(e.operation.as_str()),
            AppError::CompletionApi(e) => Some(e.operation.as_str()),
            AppError::Storage { operation, .. } => Some(*operation),
            _ => None,
        }
    }

    /// 托管 API 响应里的请求 ID，便于向服务方排查
    pub fn request_id(&self) -> Option<&str> {
        match self {
            AppError::RemoteApi(e) => e.request_id.as_deref(),
            _ => None,
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            AppError::RemoteApi(e) => e.status,
            AppError::CompletionApi(e) => e.status,
            _ => None,
        }
    }

    /// 原始消息
    pub fn message(&self) -> String {
        match self {
            AppError::RemoteApi(e) => e.message.clone(),
            AppError::CompletionApi(e) => e.message.clone(),
            AppError::Validation(msg) | AppError::Cancelled(msg) | AppError::Unknown(msg) => msg.clone(),
            AppError::Storage { source, .. } => source.to_string(),
            AppError::RateLimiter(e) => e.to_string(),
        }
    }

    /// 把任意可显示的值归一化为 `Unknown`
    pub fn unknown(value: impl fmt::Display) -> Self {
        AppError::Unknown(value.to_string())
    }

    pub fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| AppError::Storage { operation, source }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::RemoteApi(e) if e.is_not_found())
    }

    /// 转换为可持久化的记录
    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            operation: self.operation().map(str::to_string),
            status: self.status_code(),
            request_id: self.request_id().map(str::to_string),
            message: self.message(),
        }
    }
}

fn snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, c) in name.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// 持久化到 `processed_results.error` 的错误记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub operation: Option<String>,
    pub status: Option<u16>,
    /// 旧快照里没有该字段
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub message: String,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.operation, self.status) {
            (Some(op), Some(status)) => write!(f, "[{}] {} ({}): {}", self.kind, op, status, self.message),
            (Some(op), None) => write!(f, "[{}] {}: {}", self.kind, op, self.message),
            _ => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;

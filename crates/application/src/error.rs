use domain::DomainError;
use thiserror::Error;

/// 建连阶段的认证失败，发生在任何状态变更之前
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid session token")]
    InvalidToken,
    #[error("session expired")]
    Expired,
    #[error("account is banned")]
    Banned,
    #[error("too many connection attempts")]
    RateLimited,
    #[error("too many connections: {current}/{max}")]
    TooManyConnections { current: u32, max: u32 },
}

#[derive(Debug, Error)]
pub enum BroadcastError {
    /// 既无显式目标也匹配不到默认路由
    #[error("unroutable event: {0}")]
    Unroutable(String),
    #[error("bus publish failed: {0}")]
    Bus(String),
}

impl BroadcastError {
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus(message.into())
    }
}

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error("invalid message: {0}")]
    Validation(#[from] DomainError),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn access_denied(resource: impl ToString) -> Self {
        ApplicationError::AccessDenied(resource.to_string())
    }

    /// `error` 帧里携带的稳定错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Auth(_) => "AUTH_FAILED",
            ApplicationError::AccessDenied(_) => "ACCESS_DENIED",
            ApplicationError::RateLimited => "RATE_LIMITED",
            ApplicationError::Validation(_) => "VALIDATION_FAILED",
            ApplicationError::PermissionDenied(_) => "PERMISSION_DENIED",
            ApplicationError::NotFound(_) => "NOT_FOUND",
            ApplicationError::Conflict(_) => "CONFLICT",
            ApplicationError::Broadcast(BroadcastError::Unroutable(_)) => "UNROUTABLE",
            ApplicationError::Broadcast(_) | ApplicationError::Infrastructure(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// 发给客户端的文本，内部故障不泄露细节
    pub fn client_message(&self) -> String {
        match self {
            ApplicationError::Broadcast(BroadcastError::Bus(_))
            | ApplicationError::Infrastructure(_) => "internal error, please retry".to_string(),
            other => other.to_string(),
        }
    }

    /// 是否属于服务端故障
    pub fn is_internal(&self) -> bool {
        matches!(self.code(), "INTERNAL_ERROR")
    }
}

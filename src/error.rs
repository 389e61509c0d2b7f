use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 认证核心错误类型
///
/// 令牌语义错误（无效、过期、权限不足等）与基础设施错误（存储不可用、配置错误）
/// 是两个独立的类别，调用方必须能区分"令牌无效"和"存储不可用"。
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    /// 无效令牌（格式错误、签名不匹配、签发者/受众不符、会话不存在）
    #[error("Invalid {token_type} token: {reason}")]
    InvalidToken { token_type: String, reason: String },

    /// 令牌已过期
    #[error("{token_type} token expired at {expired_at}")]
    TokenExpired {
        token_type: String,
        expired_at: DateTime<Utc>,
    },

    /// 不支持的认证/令牌类型
    #[error("Unsupported auth type: {auth_type}")]
    UnsupportedAuthType {
        auth_type: String,
        supported: Vec<String>,
    },

    /// 尝试次数过多
    #[error("Too many {operation} attempts, retry after {retry_after_secs}s")]
    TooManyAttempts {
        operation: String,
        max_attempts: u32,
        retry_after_secs: u64,
    },

    /// 权限不足
    #[error("Permission denied for {subject}")]
    PermissionDenied {
        subject: String,
        required: Vec<String>,
    },

    /// 请求参数校验失败
    #[error("Validation error: {0}")]
    Validation(String),

    /// 会话存储不可用（连接失败、命令失败、超时）
    #[error("Session store error: {0}")]
    Store(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    pub fn invalid_token(token_type: impl Into<String>, reason: impl Into<String>) -> Self {
        AuthError::InvalidToken {
            token_type: token_type.into(),
            reason: reason.into(),
        }
    }

    pub fn token_expired(token_type: impl Into<String>, expired_at: DateTime<Utc>) -> Self {
        AuthError::TokenExpired {
            token_type: token_type.into(),
            expired_at,
        }
    }

    pub fn unsupported_auth_type(auth_type: impl Into<String>, supported: &[&str]) -> Self {
        AuthError::UnsupportedAuthType {
            auth_type: auth_type.into(),
            supported: supported.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn too_many_attempts(
        operation: impl Into<String>,
        max_attempts: u32,
        retry_after: std::time::Duration,
    ) -> Self {
        AuthError::TooManyAttempts {
            operation: operation.into(),
            max_attempts,
            retry_after_secs: retry_after.as_secs(),
        }
    }

    pub fn permission_denied<I, S>(subject: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AuthError::PermissionDenied {
            subject: subject.into(),
            required: required.into_iter().map(Into::into).collect(),
        }
    }

    /// 是否为基础设施错误（不能被解释为令牌被撤销）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            AuthError::Store(_)
                | AuthError::Configuration(_)
                | AuthError::Serialization(_)
                | AuthError::Internal(_)
        )
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::from(self)
    }

    /// 面向客户端的错误消息，基础设施错误不暴露后端原始信息
    pub fn client_message(&self) -> String {
        match self {
            AuthError::Store(_) => "session store unavailable".to_string(),
            AuthError::Configuration(_) => "authentication service misconfigured".to_string(),
            AuthError::Serialization(_) | AuthError::Internal(_) => {
                "internal authentication error".to_string()
            }
            other => other.to_string(),
        }
    }

    /// 结构化错误详情
    pub fn details(&self) -> BTreeMap<String, Value> {
        let mut details = BTreeMap::new();
        match self {
            AuthError::InvalidToken { token_type, reason } => {
                details.insert("token_type".to_string(), json!(token_type));
                details.insert("reason".to_string(), json!(reason));
            }
            AuthError::TokenExpired {
                token_type,
                expired_at,
            } => {
                details.insert("token_type".to_string(), json!(token_type));
                details.insert("expired_time".to_string(), json!(expired_at.to_rfc3339()));
            }
            AuthError::UnsupportedAuthType {
                auth_type,
                supported,
            } => {
                details.insert("auth_type".to_string(), json!(auth_type));
                details.insert("supported_types".to_string(), json!(supported));
            }
            AuthError::TooManyAttempts {
                operation,
                max_attempts,
                retry_after_secs,
            } => {
                details.insert("operation".to_string(), json!(operation));
                details.insert("max_attempts".to_string(), json!(max_attempts));
                details.insert("retry_after_secs".to_string(), json!(retry_after_secs));
            }
            AuthError::PermissionDenied { subject, required } => {
                details.insert("subject".to_string(), json!(subject));
                details.insert("required_permissions".to_string(), json!(required));
            }
            AuthError::Validation(msg) => {
                details.insert("reason".to_string(), json!(msg));
            }
            AuthError::Store(_)
            | AuthError::Configuration(_)
            | AuthError::Serialization(_)
            | AuthError::Internal(_) => {}
        }
        details
    }

    /// 生成带 trace id 和时间戳的完整错误信息
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.client_message(),
            details: self.details(),
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<redis::RedisError> for AuthError {
    fn from(err: redis::RedisError) -> Self {
        AuthError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for AuthError {
    fn from(err: serde_json::Error) -> Self {
        AuthError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AuthError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AuthError::Store(format!("command timeout: {}", err))
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AuthError>;

/// 错误代码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidToken = 1001,
    TokenExpired = 1002,
    UnsupportedAuthType = 1003,
    TooManyAttempts = 1004,
    PermissionDenied = 1005,
    ValidationError = 1006,
    StoreUnavailable = 2001,
    ConfigurationError = 2002,
    SerializationError = 2003,
    InternalError = 2004,
}

impl ErrorCode {
    /// 稳定的字符串错误码，供客户端分支判断
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidToken => "INVALID_TOKEN",
            ErrorCode::TokenExpired => "TOKEN_EXPIRED",
            ErrorCode::UnsupportedAuthType => "UNSUPPORTED_AUTH_TYPE",
            ErrorCode::TooManyAttempts => "TOO_MANY_ATTEMPTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(error: &AuthError) -> Self {
        match error {
            AuthError::InvalidToken { .. } => ErrorCode::InvalidToken,
            AuthError::TokenExpired { .. } => ErrorCode::TokenExpired,
            AuthError::UnsupportedAuthType { .. } => ErrorCode::UnsupportedAuthType,
            AuthError::TooManyAttempts { .. } => ErrorCode::TooManyAttempts,
            AuthError::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            AuthError::Validation(_) => ErrorCode::ValidationError,
            AuthError::Store(_) => ErrorCode::StoreUnavailable,
            AuthError::Configuration(_) => ErrorCode::ConfigurationError,
            AuthError::Serialization(_) => ErrorCode::SerializationError,
            AuthError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// 错误信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// 错误代码
    pub code: ErrorCode,
    /// 错误消息（客户端安全）
    pub message: String,
    /// 详细信息
    pub details: BTreeMap<String, Value>,
    /// 追踪 ID
    pub trace_id: String,
    /// 时间戳
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_errors_are_not_infrastructure() {
        assert!(!AuthError::invalid_token("access", "bad signature").is_infrastructure());
        assert!(!AuthError::token_expired("refresh", Utc::now()).is_infrastructure());
        assert!(AuthError::Store("connection refused".to_string()).is_infrastructure());
    }

    #[test]
    fn test_store_error_does_not_leak_backend_text() {
        let err = AuthError::Store("Connection refused (os error 111) at 10.0.0.5:6379".to_string());
        let info = err.error_info();

        assert_eq!(info.code, ErrorCode::StoreUnavailable);
        assert_eq!(info.message, "session store unavailable");
        assert!(!info.message.contains("10.0.0.5"));
        assert!(info.details.is_empty());
    }

    #[test]
    fn test_error_info_carries_details_and_trace_id() {
        let err = AuthError::invalid_token("refresh", "refresh token reuse detected");
        let first = err.error_info();
        let second = err.error_info();

        assert_eq!(first.code.as_str(), "INVALID_TOKEN");
        assert_eq!(first.details["token_type"], json!("refresh"));
        assert_eq!(first.details["reason"], json!("refresh token reuse detected"));
        assert_ne!(first.trace_id, second.trace_id);
    }

    #[test]
    fn test_taxonomy_codes() {
        let too_many = AuthError::too_many_attempts("refresh", 5, Duration::from_secs(600));
        assert_eq!(too_many.code(), ErrorCode::TooManyAttempts);
        assert_eq!(too_many.details()["retry_after_secs"], json!(600));

        let unsupported = AuthError::unsupported_auth_type("verification", &["access", "refresh"]);
        assert_eq!(unsupported.code().as_str(), "UNSUPPORTED_AUTH_TYPE");

        let denied = AuthError::permission_denied("alice", ["user:delete"]);
        assert_eq!(denied.code().as_u16(), 1005);
        assert_eq!(denied.details()["required_permissions"], json!(["user:delete"]));
    }
}

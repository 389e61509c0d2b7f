use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AuthError, Result};

/// 管理员角色
pub const ROLE_ADMIN: &str = "ADMIN";
/// 访客角色
pub const ROLE_GUEST: &str = "GUEST";

/// 身份快照
///
/// 由上游凭证校验产生，签发时写入令牌 claims 和会话记录。
/// 角色差异只通过 `roles` 集合表达，能力判断由角色集合推导。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: u64,
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Identity {
    pub fn new(user_id: u64, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            user_id,
            display_name: username.clone(),
            username,
            email: None,
            mobile: None,
            roles: BTreeSet::new(),
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_mobile(mut self, mobile: impl Into<String>) -> Self {
        self.mobile = Some(mobile.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ROLE_ADMIN)
    }

    pub fn is_guest(&self) -> bool {
        self.has_role(ROLE_GUEST)
    }

    /// 要求具备指定权限，管理员视为拥有全部权限
    pub fn require_permission(&self, permission: &str) -> Result<()> {
        if self.is_admin() || self.has_permission(permission) {
            Ok(())
        } else {
            Err(AuthError::permission_denied(
                self.username.clone(),
                [permission],
            ))
        }
    }

    /// 签发前的基本校验
    pub fn validate(&self) -> Result<()> {
        if self.user_id == 0 {
            return Err(AuthError::Validation("user_id must not be 0".to_string()));
        }
        if self.username.trim().is_empty() {
            return Err(AuthError::Validation("username must not be empty".to_string()));
        }
        Ok(())
    }
}

/// 令牌类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub const SUPPORTED: [&'static str; 2] = ["access", "refresh"];

    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }

    /// 解析令牌类型，未知类型返回 UnsupportedAuthType
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "access" => Ok(TokenType::Access),
            "refresh" => Ok(TokenType::Refresh),
            _ => Err(AuthError::unsupported_auth_type(
                value,
                &Self::SUPPORTED,
            )),
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 客户端类型
///
/// 宽松解析：无法识别的类型保留原值，使用默认访问令牌有效期。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClientType {
    Web,
    App,
    Mini,
    Other(String),
}

impl ClientType {
    pub fn as_str(&self) -> &str {
        match self {
            ClientType::Web => "web",
            ClientType::App => "app",
            ClientType::Mini => "mini",
            ClientType::Other(other) => other.as_str(),
        }
    }
}

impl Default for ClientType {
    fn default() -> Self {
        ClientType::Web
    }
}

impl From<&str> for ClientType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "web" | "pc" => ClientType::Web,
            "app" | "ios" | "android" => ClientType::App,
            "mini" | "miniprogram" | "mini_program" => ClientType::Mini,
            _ => ClientType::Other(value.trim().to_string()),
        }
    }
}

impl From<String> for ClientType {
    fn from(value: String) -> Self {
        ClientType::from(value.as_str())
    }
}

impl From<ClientType> for String {
    fn from(value: ClientType) -> Self {
        value.as_str().to_string()
    }
}

impl FromStr for ClientType {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(ClientType::from(s))
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// JWT 标准字段 - 主题 (用户名)
    pub sub: String,
    pub user_id: u64,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub roles: BTreeSet<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    pub token_type: TokenType,
    pub client_type: ClientType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mobile: Option<String>,
    /// JWT 标准字段 - 签发者
    pub iss: String,
    /// JWT 标准字段 - 签发时间 (Unix timestamp)
    pub iat: i64,
    /// JWT 标准字段 - 过期时间 (Unix timestamp)
    pub exp: i64,
    /// JWT 标准字段 - 受众
    pub aud: Vec<String>,
    /// JWT 标准字段 - JWT ID，保证同一秒内签发的令牌互不相同
    pub jti: String,
}

impl TokenClaims {
    /// 从 claims 还原身份快照
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id,
            username: self.sub.clone(),
            display_name: self.display_name.clone(),
            email: self.email.clone(),
            mobile: self.mobile.clone(),
            roles: self.roles.clone(),
            permissions: self.permissions.clone(),
        }
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.iat)
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        timestamp_to_datetime(self.exp)
    }

    /// 距离过期的剩余时间，已过期返回 0
    pub fn remaining(&self) -> Duration {
        remaining_until(self.exp)
    }

    pub fn is_expired(&self) -> bool {
        self.exp <= Utc::now().timestamp()
    }
}

pub(crate) fn timestamp_to_datetime(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}

pub(crate) fn remaining_until(exp: i64) -> Duration {
    let secs = exp - Utc::now().timestamp();
    if secs > 0 {
        Duration::from_secs(secs as u64)
    } else {
        Duration::ZERO
    }
}

/// 令牌对
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// 固定为 "Bearer"
    pub token_type: String,
    /// 访问令牌有效期（秒）
    pub expires_in: u64,
    /// 刷新令牌有效期（秒）
    pub refresh_expires_in: u64,
    pub identity: Identity,
}

/// 令牌状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenStatus {
    Valid,
    Expired,
    Revoked,
    Invalid,
    Blacklisted,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Valid => "VALID",
            TokenStatus::Expired => "EXPIRED",
            TokenStatus::Revoked => "REVOKED",
            TokenStatus::Invalid => "INVALID",
            TokenStatus::Blacklisted => "BLACKLISTED",
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 验证结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub status: TokenStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub validated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl ValidationResult {
    pub fn valid(identity: &Identity) -> Self {
        Self {
            valid: true,
            status: TokenStatus::Valid,
            reason: None,
            validated_at: Utc::now(),
            user_id: Some(identity.user_id),
            permissions: identity.permissions.clone(),
        }
    }

    pub fn invalid(status: TokenStatus, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            status,
            reason: Some(reason.into()),
            validated_at: Utc::now(),
            user_id: None,
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_user_id(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }
}

/// 令牌详情（只读模型）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDetails {
    pub token: String,
    pub token_type: TokenType,
    pub user_id: u64,
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 剩余有效时间（秒）
    pub remaining_secs: u64,
    pub status: TokenStatus,
    pub client_type: ClientType,
    pub device_id: Option<String>,
    pub claims: serde_json::Value,
}

impl TokenDetails {
    pub fn remaining(&self) -> Duration {
        Duration::from_secs(self.remaining_secs)
    }
}

/// 会话记录：访问令牌对应的身份快照，以及与之配对的刷新令牌
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// 清理报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupReport {
    /// 扫描的用户索引数
    pub indexes_scanned: u64,
    /// 扫描的索引成员数
    pub tokens_scanned: u64,
    /// 移除的悬挂成员数
    pub removed: u64,
    /// 扫描的刷新索引成员数
    #[serde(default)]
    pub refresh_pairs_scanned: u64,
    /// 移除的失效刷新索引成员数（刷新令牌已过期或已轮换）
    #[serde(default)]
    pub refresh_pairs_removed: u64,
    pub duration_ms: u64,
    pub finished_at: Option<DateTime<Utc>>,
}

/// 日志中使用的令牌掩码：保留前 8 位和后 4 位
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "***".to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// chrono 与 std Duration 互转，负值视为 0
pub(crate) fn to_chrono(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
}

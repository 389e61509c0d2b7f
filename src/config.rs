use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::auth::models::ClientType;
use crate::error::AuthError;

/// 签名密钥最小长度（字节），HS512 要求不少于 64 字节
pub const MIN_SECRET_LEN: usize = 64;

/// 默认配置文件名
pub const DEFAULT_CONFIG_FILE: &str = "tokengate.toml";

/// 认证核心配置
///
/// 启动时加载一次，之后作为不可变值显式传入各服务的构造函数。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// 令牌配置
    pub token: TokenConfig,
    /// 会话存储配置
    pub store: StoreConfig,
    /// 清理任务配置
    pub cleanup: CleanupConfig,
    /// 日志配置
    pub logging: LoggingConfig,
}

/// 令牌配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// HMAC 签名密钥
    pub secret: String,
    /// 签发者
    pub issuer: String,
    /// 受众列表
    pub audience: Vec<String>,
    /// 未知客户端类型的访问令牌有效期（秒）
    pub access_ttl_secs: u64,
    /// Web 端访问令牌有效期（秒）
    pub web_access_ttl_secs: u64,
    /// App 端访问令牌有效期（秒）
    pub app_access_ttl_secs: u64,
    /// 小程序访问令牌有效期（秒）
    pub mini_access_ttl_secs: u64,
    /// 刷新令牌有效期（秒）
    pub refresh_ttl_secs: u64,
    /// 时钟偏差容忍（秒），默认不容忍
    pub clock_skew_secs: u64,
    /// "即将过期"阈值（秒）
    pub expiring_soon_threshold_secs: u64,
    /// 检测到刷新令牌重用时是否撤销该用户全部会话
    pub revoke_family_on_reuse: bool,
    /// 轮换后的宽限期（秒）：宽限期内的重复刷新视为并发竞争失败，不触发会话撤销
    pub refresh_reuse_grace_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "tokengate".to_string(),
            audience: vec![
                "tokengate-client".to_string(),
                "tokengate-web".to_string(),
                "tokengate-app".to_string(),
            ],
            access_ttl_secs: 24 * 3600,
            web_access_ttl_secs: 2 * 3600,
            app_access_ttl_secs: 24 * 3600,
            mini_access_ttl_secs: 24 * 3600,
            refresh_ttl_secs: 7 * 24 * 3600,
            clock_skew_secs: 0,
            expiring_soon_threshold_secs: 300,
            revoke_family_on_reuse: true,
            refresh_reuse_grace_secs: 5,
        }
    }
}

impl TokenConfig {
    /// 按客户端类型解析访问令牌有效期
    pub fn access_ttl_for(&self, client_type: &ClientType) -> Duration {
        let secs = match client_type {
            ClientType::Web => self.web_access_ttl_secs,
            ClientType::App => self.app_access_ttl_secs,
            ClientType::Mini => self.mini_access_ttl_secs,
            ClientType::Other(_) => self.access_ttl_secs,
        };
        Duration::from_secs(secs)
    }

    /// 所有客户端类型中最长的访问令牌有效期（用户令牌索引 TTL 的下限）
    pub fn max_access_ttl(&self) -> Duration {
        let secs = [
            self.access_ttl_secs,
            self.web_access_ttl_secs,
            self.app_access_ttl_secs,
            self.mini_access_ttl_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.access_ttl_secs);
        Duration::from_secs(secs)
    }

    pub fn refresh_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_ttl_secs)
    }

    pub fn expiring_soon_threshold(&self) -> Duration {
        Duration::from_secs(self.expiring_soon_threshold_secs)
    }

    pub fn refresh_reuse_grace(&self) -> Duration {
        Duration::from_secs(self.refresh_reuse_grace_secs)
    }

    fn validate(&self) -> std::result::Result<(), AuthError> {
        if self.secret.len() < MIN_SECRET_LEN {
            return Err(AuthError::Configuration(format!(
                "signing secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                self.secret.len()
            )));
        }
        if self.issuer.is_empty() {
            return Err(AuthError::Configuration("issuer must not be empty".to_string()));
        }
        if self.audience.is_empty() {
            return Err(AuthError::Configuration(
                "audience list must not be empty".to_string(),
            ));
        }
        let access_ttls = [
            ("access_ttl_secs", self.access_ttl_secs),
            ("web_access_ttl_secs", self.web_access_ttl_secs),
            ("app_access_ttl_secs", self.app_access_ttl_secs),
            ("mini_access_ttl_secs", self.mini_access_ttl_secs),
        ];
        for (name, ttl) in access_ttls {
            if ttl == 0 {
                return Err(AuthError::Configuration(format!("{} must be positive", name)));
            }
            if self.refresh_ttl_secs <= ttl {
                return Err(AuthError::Configuration(format!(
                    "refresh_ttl_secs ({}) must be longer than {} ({})",
                    self.refresh_ttl_secs, name, ttl
                )));
            }
        }
        Ok(())
    }
}

/// 会话存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Key 命名空间前缀
    pub key_prefix: String,
    /// Redis 配置（未配置时使用进程内存储）
    pub redis: Option<RedisConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "auth:".to_string(),
            redis: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 空闲连接超时时间（秒）
    pub idle_timeout_secs: u64,
    /// 单条命令超时时间（毫秒）
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            pool_size: 10,
            min_idle: 1,
            connection_timeout_secs: 5,
            idle_timeout_secs: 300,
            command_timeout_ms: 1000,
        }
    }
}

impl RedisConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// 过期索引清理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// 是否启用周期清理
    pub enabled: bool,
    /// 清理间隔（秒）
    pub interval_secs: u64,
    /// 每批扫描的索引数量
    pub batch_size: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            batch_size: 1000,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: None,
            file: None,
        }
    }
}

impl AuthConfig {
    /// 创建默认配置
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定密钥创建配置（其余使用默认值）
    pub fn with_secret(secret: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.token.secret = secret.into();
        config
    }

    /// 添加Redis配置
    pub fn with_redis(mut self, redis_url: impl Into<String>) -> Self {
        self.store.redis = Some(RedisConfig::from_url(redis_url));
        self
    }

    /// 校验配置，启动时快速失败
    pub fn validate(&self) -> std::result::Result<(), AuthError> {
        self.token.validate()?;
        if self.store.key_prefix.is_empty() {
            return Err(AuthError::Configuration(
                "store key_prefix must not be empty".to_string(),
            ));
        }
        if self.cleanup.batch_size == 0 {
            return Err(AuthError::Configuration(
                "cleanup batch_size must be positive".to_string(),
            ));
        }
        if self.cleanup.enabled && self.cleanup.interval_secs == 0 {
            return Err(AuthError::Configuration(
                "cleanup interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;

        let config: AuthConfig =
            toml::from_str(&content).with_context(|| "配置文件格式错误")?;

        Ok(config)
    }

    /// 从环境变量加载配置（TOKENGATE_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(secret) = env::var("TOKENGATE_SECRET") {
            self.token.secret = secret;
        }
        if let Ok(issuer) = env::var("TOKENGATE_ISSUER") {
            self.token.issuer = issuer;
        }
        if let Ok(audience) = env::var("TOKENGATE_AUDIENCE") {
            self.token.audience = audience
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Ok(ttl) = env::var("TOKENGATE_ACCESS_TTL_SECS") {
            self.token.access_ttl_secs = ttl
                .parse()
                .with_context(|| format!("TOKENGATE_ACCESS_TTL_SECS 不是有效数字: {}", ttl))?;
        }
        if let Ok(ttl) = env::var("TOKENGATE_REFRESH_TTL_SECS") {
            self.token.refresh_ttl_secs = ttl
                .parse()
                .with_context(|| format!("TOKENGATE_REFRESH_TTL_SECS 不是有效数字: {}", ttl))?;
        }
        if let Ok(prefix) = env::var("TOKENGATE_KEY_PREFIX") {
            self.store.key_prefix = prefix;
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            self.set_redis_url(redis_url);
        }
        if let Ok(interval) = env::var("TOKENGATE_CLEANUP_INTERVAL_SECS") {
            self.cleanup.interval_secs = interval.parse().with_context(|| {
                format!("TOKENGATE_CLEANUP_INTERVAL_SECS 不是有效数字: {}", interval)
            })?;
        }
        if let Ok(level) = env::var("TOKENGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = env::var("TOKENGATE_LOG_FORMAT") {
            self.logging.format = Some(format);
        }

        Ok(())
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(secret) = &cli.secret {
            self.token.secret = secret.clone();
        }
        if let Some(issuer) = &cli.issuer {
            self.token.issuer = issuer.clone();
        }
        if let Some(prefix) = &cli.key_prefix {
            self.store.key_prefix = prefix.clone();
        }
        if let Some(redis_url) = &cli.redis_url {
            self.set_redis_url(redis_url.clone());
        }
        if let Some(level) = cli.get_log_level() {
            self.logging.level = level;
        }
        if let Some(format) = cli.get_log_format() {
            self.logging.format = Some(format);
        }
        if let Some(file) = &cli.log_file {
            self.logging.file = Some(file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                Self::from_toml_file(config_file)?
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
                Self::default()
            }
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            info!("📄 从默认配置文件加载: {}", DEFAULT_CONFIG_FILE);
            Self::from_toml_file(DEFAULT_CONFIG_FILE)?
        } else {
            Self::default()
        };

        config.merge_from_env()?;
        config.merge_from_cli(cli);

        Ok(config)
    }

    /// 用于展示的副本（密钥脱敏）
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.token.secret = format!("<{} bytes>", self.token.secret.len());
        copy
    }

    fn set_redis_url(&mut self, url: String) {
        match self.store.redis.as_mut() {
            Some(redis) => redis.url = url,
            None => self.store.redis = Some(RedisConfig::from_url(url)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> String {
        "k".repeat(MIN_SECRET_LEN)
    }

    #[test]
    fn test_default_config_requires_secret() {
        let err = AuthConfig::default().validate().unwrap_err();
        assert!(matches!(err, AuthError::Configuration(_)));
    }

    #[test]
    fn test_short_secret_rejected() {
        let config = AuthConfig::with_secret("k".repeat(MIN_SECRET_LEN - 1));
        assert!(config.validate().is_err());
        assert!(AuthConfig::with_secret(secret()).validate().is_ok());
    }

    #[test]
    fn test_refresh_ttl_must_exceed_access_ttls() {
        let mut config = AuthConfig::with_secret(secret());
        config.token.refresh_ttl_secs = config.token.app_access_ttl_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_access_ttl_per_client_type() {
        let token = TokenConfig::default();
        assert_eq!(token.access_ttl_for(&ClientType::Web), Duration::from_secs(7200));
        assert_eq!(token.access_ttl_for(&ClientType::App), Duration::from_secs(86400));
        assert_eq!(
            token.access_ttl_for(&ClientType::Other("tv".to_string())),
            Duration::from_secs(token.access_ttl_secs)
        );
        assert_eq!(token.max_access_ttl(), Duration::from_secs(86400));
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            [token]
            secret = "0123456789012345678901234567890123456789012345678901234567890123"
            issuer = "gateway"
            web_access_ttl_secs = 900

            [store]
            key_prefix = "gw:"

            [store.redis]
            url = "redis://cache:6379"

            [cleanup]
            batch_size = 50
        "#;
        let config: AuthConfig = toml::from_str(content).unwrap();

        assert_eq!(config.token.issuer, "gateway");
        assert_eq!(config.token.web_access_ttl_secs, 900);
        assert_eq!(config.token.refresh_ttl_secs, 7 * 24 * 3600);
        assert_eq!(config.store.key_prefix, "gw:");
        assert_eq!(config.store.redis.as_ref().unwrap().pool_size, 10);
        assert_eq!(config.cleanup.batch_size, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_hides_secret() {
        let config = AuthConfig::with_secret(secret());
        let shown = config.redacted();
        assert_eq!(shown.token.secret, "<64 bytes>");
    }
}

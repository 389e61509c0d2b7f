// TokenManager - 令牌生命周期管理对外接口
// 组装签名、存储、签发、验证、刷新、撤销与清理服务

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::jwt_service::JwtService;
use crate::auth::models::{
    mask_token, CleanupReport, ClientType, Identity, TokenClaims, TokenDetails, TokenPair,
    TokenStatus, TokenType, ValidationResult,
};
use crate::auth::token_issue_service::TokenIssueService;
use crate::auth::token_refresh_service::{ReusePolicy, TokenRefreshService};
use crate::auth::token_revocation::TokenRevocationService;
use crate::auth::token_verify_service::TokenVerifyService;
use crate::config::AuthConfig;
use crate::error::{AuthError, Result};
use crate::infra::cleanup_worker::CleanupWorker;
use crate::infra::kv::KvBackend;
use crate::infra::memory_store::MemoryBackend;
use crate::infra::metrics;
use crate::infra::redis::RedisClient;
use crate::infra::session_store::SessionStore;

/// 令牌生命周期管理器
///
/// 所有操作都是 async；同步调用通过 [`TokenManager::blocking`] 获得，
/// 两种形式共享同一套实现，顺序与一致性保证完全相同。
pub struct TokenManager {
    config: Arc<AuthConfig>,
    jwt_service: Arc<JwtService>,
    store: Arc<SessionStore>,
    issuer: Arc<TokenIssueService>,
    verifier: Arc<TokenVerifyService>,
    refresher: Arc<TokenRefreshService>,
    revoker: Arc<TokenRevocationService>,
    cleanup: Arc<CleanupWorker>,
}

impl TokenManager {
    /// 以指定存储后端创建管理器，配置不合法时快速失败
    pub fn new(config: &AuthConfig, backend: Arc<dyn KvBackend>) -> Result<Self> {
        config.validate()?;

        let config = Arc::new(config.clone());
        let token_config = Arc::new(config.token.clone());

        let jwt_service = Arc::new(JwtService::new(&token_config)?);
        let store = Arc::new(SessionStore::new(
            backend,
            config.store.key_prefix.clone(),
            token_config.max_access_ttl(),
        ));
        let issuer = Arc::new(TokenIssueService::new(
            jwt_service.clone(),
            store.clone(),
            token_config.clone(),
        ));
        let verifier = Arc::new(TokenVerifyService::new(jwt_service.clone(), store.clone()));
        let revoker = Arc::new(TokenRevocationService::new(
            jwt_service.clone(),
            store.clone(),
        ));
        let refresher = Arc::new(TokenRefreshService::new(
            jwt_service.clone(),
            store.clone(),
            issuer.clone(),
            revoker.clone(),
            ReusePolicy {
                revoke_family: token_config.revoke_family_on_reuse,
                grace: token_config.refresh_reuse_grace(),
            },
        ));
        let cleanup = Arc::new(CleanupWorker::new(store.clone(), config.cleanup.clone()));

        Ok(Self {
            config,
            jwt_service,
            store,
            issuer,
            verifier,
            refresher,
            revoker,
            cleanup,
        })
    }

    /// 按配置连接存储：配置了 Redis 时使用 Redis，否则使用进程内存储
    pub async fn connect(config: &AuthConfig) -> Result<Self> {
        let backend: Arc<dyn KvBackend> = match &config.store.redis {
            Some(redis_config) => {
                let client = RedisClient::new(redis_config).await?;
                let state = client.pool_state();
                metrics::record_redis_pool(
                    state.connections - state.idle_connections,
                    state.idle_connections,
                );
                Arc::new(client)
            }
            None => {
                warn!("⚠️ 未配置 Redis，使用进程内会话存储（仅适用于单实例部署）");
                Arc::new(MemoryBackend::new())
            }
        };

        let manager = Self::new(config, backend)?;
        info!(
            "✅ TokenManager 已就绪 (issuer={}, key_prefix={})",
            manager.jwt_service.issuer(),
            manager.config.store.key_prefix
        );
        Ok(manager)
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn session_store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    // ============================================================
    // 核心操作
    // ============================================================

    pub async fn issue(
        &self,
        identity: &Identity,
        client_type: &ClientType,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        self.issuer.issue(identity, client_type, device_id).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.refresher.refresh(refresh_token).await
    }

    pub async fn refresh_batch(
        &self,
        refresh_tokens: &[String],
    ) -> HashMap<String, Result<TokenPair>> {
        self.refresher.refresh_batch(refresh_tokens).await
    }

    pub async fn verify(&self, access_token: &str) -> Result<ValidationResult> {
        self.verifier.verify(access_token).await
    }

    pub async fn verify_batch(
        &self,
        tokens: &[String],
    ) -> HashMap<String, Result<ValidationResult>> {
        self.verifier.verify_batch(tokens).await
    }

    pub async fn logout(&self, access_token: &str) -> Result<bool> {
        self.revoker.logout(access_token).await
    }

    pub async fn logout_all(&self, user_id: u64) -> Result<usize> {
        self.revoker.logout_all(user_id).await
    }

    pub async fn get_identity(&self, access_token: &str) -> Result<Identity> {
        self.verifier.get_identity(access_token).await
    }

    /// 执行一次索引清理
    pub async fn cleanup_expired(&self) -> Result<CleanupReport> {
        self.cleanup.run_once().await
    }

    // ============================================================
    // 查询与维护
    // ============================================================

    /// 令牌详情，已过期的令牌也能查询
    pub async fn token_details(&self, token: &str) -> Result<TokenDetails> {
        let claims = self.jwt_service.parse_allow_expired(token)?;

        let (status, remaining) = if claims.is_expired() {
            (TokenStatus::Expired, Duration::ZERO)
        } else {
            match claims.token_type {
                TokenType::Access => match self.store.ttl_remaining(token).await? {
                    Some(ttl) => (TokenStatus::Valid, ttl.min(claims.remaining())),
                    None => (TokenStatus::Invalid, Duration::ZERO),
                },
                TokenType::Refresh => {
                    if self.store.refresh_link(token).await?.is_some() {
                        (TokenStatus::Valid, claims.remaining())
                    } else if self.store.rotation_marker(token).await?.is_some() {
                        (TokenStatus::Revoked, Duration::ZERO)
                    } else {
                        (TokenStatus::Invalid, Duration::ZERO)
                    }
                }
            }
        };

        Self::details_from_claims(token, claims, status, remaining)
    }

    fn details_from_claims(
        token: &str,
        claims: TokenClaims,
        status: TokenStatus,
        remaining: Duration,
    ) -> Result<TokenDetails> {
        let raw = serde_json::to_value(&claims)?;
        Ok(TokenDetails {
            token: token.to_string(),
            token_type: claims.token_type,
            user_id: claims.user_id,
            issued_at: claims.issued_at(),
            expires_at: claims.expires_at(),
            remaining_secs: remaining.as_secs(),
            status,
            username: claims.sub,
            client_type: claims.client_type,
            device_id: claims.device_id,
            claims: raw,
        })
    }

    /// 令牌是否即将过期（已失效的令牌也视为即将过期）
    pub async fn is_expiring_soon(&self, token: &str, threshold: Option<Duration>) -> Result<bool> {
        let threshold = threshold.unwrap_or_else(|| self.config.token.expiring_soon_threshold());
        let details = self.token_details(token).await?;
        Ok(details.status != TokenStatus::Valid || details.remaining() <= threshold)
    }

    /// 延长访问令牌会话的有效期
    ///
    /// 令牌自身签名的 exp 不会改变，因此延长后的有效期不超过签名过期时间。
    pub async fn extend_token(&self, access_token: &str, ttl: Duration) -> Result<bool> {
        let claims = self
            .jwt_service
            .parse_typed(access_token, TokenType::Access)?;
        let capped = ttl.min(claims.remaining());
        if capped < ttl {
            warn!(
                "延长时间超过令牌签名有效期，截断为 {}s: token={}",
                capped.as_secs(),
                mask_token(access_token)
            );
        }
        self.store.extend(access_token, capped).await
    }

    /// 用户当前存活的访问令牌（多设备会话）
    pub async fn list_user_sessions(&self, user_id: u64) -> Result<Vec<TokenDetails>> {
        let mut sessions = Vec::new();
        for token in self.store.user_tokens(user_id).await? {
            match self.token_details(&token).await {
                Ok(details) if details.status == TokenStatus::Valid => sessions.push(details),
                Ok(_) => {}
                Err(e) if e.is_infrastructure() => return Err(e),
                Err(_) => {}
            }
        }
        sessions.sort_by(|a, b| a.issued_at.cmp(&b.issued_at));
        Ok(sessions)
    }

    // ============================================================
    // 后台任务与调用形式
    // ============================================================

    pub fn cleanup_worker(&self) -> Arc<CleanupWorker> {
        self.cleanup.clone()
    }

    /// 按配置启动周期清理任务
    pub fn start_cleanup(&self) -> Option<JoinHandle<()>> {
        if !self.config.cleanup.enabled {
            info!("令牌索引清理任务已禁用");
            return None;
        }
        self.cleanup.clone().start()
    }

    /// 在 Tokio 调度器上执行任意操作，返回 JoinHandle
    pub fn spawn<F, Fut, T>(self: &Arc<Self>, op: F) -> JoinHandle<Result<T>>
    where
        F: FnOnce(Arc<TokenManager>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(self.clone()))
    }

    /// 获取同步调用形式，不能在异步上下文中调用
    pub fn blocking(self: &Arc<Self>) -> Result<BlockingTokenManager> {
        BlockingTokenManager::new(self.clone())
    }
}

/// 同步调用形式
///
/// 持有一个独立的 Tokio 运行时，所有同步方法都通过 `run` 驱动对应的异步实现。
/// 使用 Redis 时应通过 [`BlockingTokenManager::connect`] 创建，保证连接池运行在同一个运行时上。
pub struct BlockingTokenManager {
    manager: Arc<TokenManager>,
    runtime: Runtime,
}

impl BlockingTokenManager {
    fn build_runtime() -> Result<Runtime> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| AuthError::Internal(format!("Failed to build runtime: {}", e)))
    }

    pub fn new(manager: Arc<TokenManager>) -> Result<Self> {
        Ok(Self {
            manager,
            runtime: Self::build_runtime()?,
        })
    }

    pub fn connect(config: &AuthConfig) -> Result<Self> {
        let runtime = Self::build_runtime()?;
        let manager = Arc::new(runtime.block_on(TokenManager::connect(config))?);
        Ok(Self { manager, runtime })
    }

    /// 阻塞执行任意异步操作
    pub fn run<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    pub fn issue(
        &self,
        identity: &Identity,
        client_type: &ClientType,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        self.run(self.manager.issue(identity, client_type, device_id))
    }

    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.run(self.manager.refresh(refresh_token))
    }

    pub fn refresh_batch(&self, refresh_tokens: &[String]) -> HashMap<String, Result<TokenPair>> {
        self.run(self.manager.refresh_batch(refresh_tokens))
    }

    pub fn verify(&self, access_token: &str) -> Result<ValidationResult> {
        self.run(self.manager.verify(access_token))
    }

    pub fn verify_batch(&self, tokens: &[String]) -> HashMap<String, Result<ValidationResult>> {
        self.run(self.manager.verify_batch(tokens))
    }

    pub fn logout(&self, access_token: &str) -> Result<bool> {
        self.run(self.manager.logout(access_token))
    }

    pub fn logout_all(&self, user_id: u64) -> Result<usize> {
        self.run(self.manager.logout_all(user_id))
    }

    pub fn get_identity(&self, access_token: &str) -> Result<Identity> {
        self.run(self.manager.get_identity(access_token))
    }

    pub fn cleanup_expired(&self) -> Result<CleanupReport> {
        self.run(self.manager.cleanup_expired())
    }

    pub fn token_details(&self, token: &str) -> Result<TokenDetails> {
        self.run(self.manager.token_details(token))
    }

    pub fn is_expiring_soon(&self, token: &str, threshold: Option<Duration>) -> Result<bool> {
        self.run(self.manager.is_expiring_soon(token, threshold))
    }

    pub fn extend_token(&self, access_token: &str, ttl: Duration) -> Result<bool> {
        self.run(self.manager.extend_token(access_token, ttl))
    }

    pub fn list_user_sessions(&self, user_id: u64) -> Result<Vec<TokenDetails>> {
        self.run(self.manager.list_user_sessions(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<TokenManager> {
        let config = AuthConfig::with_secret("m".repeat(64));
        Arc::new(TokenManager::new(&config, Arc::new(MemoryBackend::new())).unwrap())
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = AuthConfig::with_secret("short");
        assert!(matches!(
            TokenManager::new(&config, Arc::new(MemoryBackend::new())),
            Err(AuthError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_token_details() {
        let manager = manager();
        let alice = Identity::new(1, "alice");
        let pair = manager
            .issue(&alice, &ClientType::Web, Some("browser"))
            .await
            .unwrap();

        let details = manager.token_details(&pair.access_token).await.unwrap();
        assert_eq!(details.status, TokenStatus::Valid);
        assert_eq!(details.token_type, TokenType::Access);
        assert_eq!(details.username, "alice");
        assert_eq!(details.device_id.as_deref(), Some("browser"));
        assert!(details.remaining_secs <= 7200 && details.remaining_secs > 7000);
        assert_eq!(details.claims["user_id"], 1);

        let refresh = manager.token_details(&pair.refresh_token).await.unwrap();
        assert_eq!(refresh.status, TokenStatus::Valid);

        manager.refresh(&pair.refresh_token).await.unwrap();
        let rotated = manager.token_details(&pair.refresh_token).await.unwrap();
        assert_eq!(rotated.status, TokenStatus::Revoked);
        let old_access = manager.token_details(&pair.access_token).await.unwrap();
        assert_eq!(old_access.status, TokenStatus::Invalid);
    }

    #[tokio::test]
    async fn test_extend_and_expiring_soon() {
        let manager = manager();
        let pair = manager
            .issue(&Identity::new(2, "bob"), &ClientType::Web, None)
            .await
            .unwrap();

        assert!(!manager.is_expiring_soon(&pair.access_token, None).await.unwrap());
        assert!(manager
            .extend_token(&pair.access_token, Duration::from_secs(60))
            .await
            .unwrap());
        assert!(manager.is_expiring_soon(&pair.access_token, None).await.unwrap());

        // 不能超过签名有效期
        assert!(manager
            .extend_token(&pair.access_token, Duration::from_secs(30 * 24 * 3600))
            .await
            .unwrap());
        let details = manager.token_details(&pair.access_token).await.unwrap();
        assert!(details.remaining_secs <= 7200);
    }

    #[tokio::test]
    async fn test_list_user_sessions() {
        let manager = manager();
        let carol = Identity::new(3, "carol");
        let web = manager.issue(&carol, &ClientType::Web, Some("pc")).await.unwrap();
        let app = manager.issue(&carol, &ClientType::App, Some("phone")).await.unwrap();

        let sessions = manager.list_user_sessions(3).await.unwrap();
        assert_eq!(sessions.len(), 2);

        manager.logout(&web.access_token).await.unwrap();
        let sessions = manager.list_user_sessions(3).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].token, app.access_token);
        assert_eq!(sessions[0].client_type, ClientType::App);
    }

    #[tokio::test]
    async fn test_spawn_runs_on_scheduler() {
        let manager = manager();
        let handle = manager.spawn(|m| async move {
            let pair = m
                .issue(&Identity::new(4, "dave"), &ClientType::Mini, None)
                .await?;
            m.verify(&pair.access_token).await
        });
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, TokenStatus::Valid);
    }
}

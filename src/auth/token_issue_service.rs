use crate::auth::jwt_service::JwtService;
use crate::auth::models::{mask_token, to_chrono, ClientType, Identity, TokenPair, TokenType};
use crate::config::TokenConfig;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::session_store::SessionStore;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Token 签发服务
///
/// 签发访问/刷新令牌对，并写入会话记录与刷新令牌关联。
/// 两次写入不依赖存储的两阶段提交：第二次写入失败时删除第一次写入的会话作为补偿。
pub struct TokenIssueService {
    jwt_service: Arc<JwtService>,
    store: Arc<SessionStore>,
    config: Arc<TokenConfig>,
}

impl TokenIssueService {
    pub fn new(
        jwt_service: Arc<JwtService>,
        store: Arc<SessionStore>,
        config: Arc<TokenConfig>,
    ) -> Self {
        Self {
            jwt_service,
            store,
            config,
        }
    }

    /// 签发令牌对
    pub async fn issue(
        &self,
        identity: &Identity,
        client_type: &ClientType,
        device_id: Option<&str>,
    ) -> Result<TokenPair> {
        debug!(
            "收到 token 签发请求: user_id={}, client_type={}, device_id={:?}",
            identity.user_id, client_type, device_id
        );

        // 1. 校验身份
        identity.validate()?;

        // 2. 按客户端类型解析有效期
        let access_ttl = self.config.access_ttl_for(client_type);
        let refresh_ttl = self.config.refresh_ttl();

        // 3. 签名
        let access_token = self.jwt_service.generate(
            identity,
            TokenType::Access,
            client_type,
            device_id,
            to_chrono(access_ttl),
        )?;
        let refresh_token = self.jwt_service.generate(
            identity,
            TokenType::Refresh,
            client_type,
            device_id,
            to_chrono(refresh_ttl),
        )?;

        // 4. 写入会话记录 + 用户索引
        self.store
            .put(&access_token, identity, Some(&refresh_token), access_ttl)
            .await?;

        // 5. 写入刷新令牌关联，失败则补偿删除会话
        if let Err(e) = self
            .store
            .put_refresh_link(&refresh_token, &access_token, identity.user_id, refresh_ttl)
            .await
        {
            warn!(
                "⚠️ 刷新令牌关联写入失败，回滚会话: user_id={}, token={}, error={}",
                identity.user_id,
                mask_token(&access_token),
                e
            );
            if let Err(rollback) = self.store.remove(&access_token).await {
                error!(
                    "❌ 会话回滚失败，访问令牌将在 {}s 后自然过期: token={}, error={}",
                    access_ttl.as_secs(),
                    mask_token(&access_token),
                    rollback
                );
            }
            return Err(e);
        }

        metrics::record_issued(client_type.as_str());
        info!(
            "✅ Token 签发成功: user_id={}, client_type={}, device_id={:?}, access_ttl={}s",
            identity.user_id,
            client_type,
            device_id,
            access_ttl.as_secs()
        );

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: access_ttl.as_secs(),
            refresh_expires_in: refresh_ttl.as_secs(),
            identity: identity.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthError;
    use crate::infra::fault_backend::FaultBackend;
    use crate::infra::kv::KvBackend;
    use crate::infra::memory_store::MemoryBackend;

    fn config() -> TokenConfig {
        TokenConfig {
            secret: "k".repeat(64),
            ..TokenConfig::default()
        }
    }

    fn service(backend: Arc<dyn KvBackend>) -> (TokenIssueService, Arc<SessionStore>, Arc<JwtService>) {
        let config = Arc::new(config());
        let jwt = Arc::new(JwtService::new(&config).unwrap());
        let store = Arc::new(SessionStore::new(backend, "test:", config.max_access_ttl()));
        (
            TokenIssueService::new(jwt.clone(), store.clone(), config),
            store,
            jwt,
        )
    }

    #[tokio::test]
    async fn test_issue_persists_session_and_link() {
        let (service, store, jwt) = service(Arc::new(MemoryBackend::new()));
        let alice = Identity::new(1, "alice").with_role("USER");

        let pair = service
            .issue(&alice, &ClientType::Web, Some("browser-1"))
            .await
            .unwrap();

        assert_eq!(pair.token_type, "Bearer");
        assert_eq!(pair.expires_in, 7200);
        assert!(pair.refresh_expires_in > pair.expires_in);
        assert_eq!(store.get(&pair.access_token).await.unwrap(), Some(alice));
        assert_eq!(
            store.refresh_link(&pair.refresh_token).await.unwrap(),
            Some(pair.access_token.clone())
        );

        let claims = jwt.parse(&pair.refresh_token).unwrap();
        assert_eq!(claims.token_type, TokenType::Refresh);
        assert_eq!(claims.device_id.as_deref(), Some("browser-1"));
    }

    #[tokio::test]
    async fn test_issue_rejects_invalid_identity() {
        let (service, _, _) = service(Arc::new(MemoryBackend::new()));
        let err = service
            .issue(&Identity::new(0, "ghost"), &ClientType::App, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
    }

    #[tokio::test]
    async fn test_issue_compensates_when_link_write_fails() {
        let (service, store, _) = service(Arc::new(FaultBackend::new().failing_refresh_links()));
        let bob = Identity::new(2, "bob");

        let err = service.issue(&bob, &ClientType::App, None).await.unwrap_err();
        assert!(matches!(err, AuthError::Store(_)));

        // 没有遗留的会话和索引成员
        assert!(store.user_tokens(2).await.unwrap().is_empty());
    }
}

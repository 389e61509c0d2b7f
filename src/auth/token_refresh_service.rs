use crate::auth::jwt_service::JwtService;
use crate::auth::models::{mask_token, TokenClaims, TokenPair, TokenType};
use crate::auth::token_issue_service::TokenIssueService;
use crate::auth::token_revocation::TokenRevocationService;
use crate::error::{AuthError, Result};
use crate::infra::metrics::{self, RefreshOutcome};
use crate::infra::session_store::SessionStore;
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 刷新令牌重用策略
#[derive(Debug, Clone, Copy)]
pub struct ReusePolicy {
    /// 检测到重用时撤销该用户的全部会话
    pub revoke_family: bool,
    /// 轮换后的宽限期，期间的重复刷新按并发竞争失败处理
    pub grace: Duration,
}

/// Token 刷新服务
///
/// 刷新令牌关联的原子删除（GETDEL）是并发刷新的唯一仲裁点：
/// 同一刷新令牌的多个并发请求中，只有拿到关联的那个能完成轮换。
pub struct TokenRefreshService {
    jwt_service: Arc<JwtService>,
    store: Arc<SessionStore>,
    issuer: Arc<TokenIssueService>,
    revoker: Arc<TokenRevocationService>,
    reuse_policy: ReusePolicy,
}

impl TokenRefreshService {
    pub fn new(
        jwt_service: Arc<JwtService>,
        store: Arc<SessionStore>,
        issuer: Arc<TokenIssueService>,
        revoker: Arc<TokenRevocationService>,
        reuse_policy: ReusePolicy,
    ) -> Self {
        Self {
            jwt_service,
            store,
            issuer,
            revoker,
            reuse_policy,
        }
    }

    /// 使用刷新令牌轮换令牌对
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let result = self.refresh_inner(refresh_token).await;
        if let Err(e) = &result {
            if !matches!(e, AuthError::InvalidToken { reason, .. } if reason == REUSE_DETECTED) {
                metrics::record_refresh(RefreshOutcome::Rejected);
            }
            debug!(
                "刷新失败: token={}, error={}",
                mask_token(refresh_token),
                e
            );
        }
        result
    }

    async fn refresh_inner(&self, refresh_token: &str) -> Result<TokenPair> {
        // 1. 校验刷新令牌本身
        let claims = self
            .jwt_service
            .parse_typed(refresh_token, TokenType::Refresh)?;

        // 2. 取走刷新令牌关联（仲裁点）
        let old_access = match self.store.take_refresh_link(refresh_token).await? {
            Some(access) => access,
            None => return Err(self.missing_link(refresh_token).await?),
        };

        // 3. 轮换，失败时恢复关联，刷新令牌仍可重试
        let pair = match self.rotate(&claims, &old_access).await {
            Ok(pair) => pair,
            Err(e) => {
                let remaining = claims.remaining();
                if !remaining.is_zero() {
                    if let Err(restore) = self
                        .store
                        .put_refresh_link(refresh_token, &old_access, claims.user_id, remaining)
                        .await
                    {
                        error!(
                            "❌ 恢复刷新令牌关联失败: token={}, error={}",
                            mask_token(refresh_token),
                            restore
                        );
                    }
                }
                return Err(e);
            }
        };

        // 4. 旧访问令牌可能早已过期，单独清掉旧的刷新索引成员
        if let Err(e) = self
            .store
            .unlink_refresh_pair(claims.user_id, &old_access, refresh_token)
            .await
        {
            warn!(
                "⚠️ 清理旧刷新索引成员失败: user_id={}, error={}",
                claims.user_id, e
            );
        }

        // 5. 记录重用标记
        if let Err(e) = self
            .store
            .mark_refresh_rotated(refresh_token, claims.user_id, claims.remaining())
            .await
        {
            warn!(
                "⚠️ 写入刷新重用标记失败，重用检测对该令牌失效: token={}, error={}",
                mask_token(refresh_token),
                e
            );
        }

        metrics::record_refresh(RefreshOutcome::Ok);
        info!(
            "🔄 Token 轮换成功: user_id={}, client_type={}, old_access={}, new_access={}",
            claims.user_id,
            claims.client_type,
            mask_token(&old_access),
            mask_token(&pair.access_token)
        );

        Ok(pair)
    }

    /// 签发新令牌对并使旧访问令牌失效
    async fn rotate(&self, claims: &TokenClaims, old_access: &str) -> Result<TokenPair> {
        // 旧访问令牌仍存活时使用其身份快照，否则从刷新令牌 claims 还原
        let identity = match self.store.get(old_access).await? {
            Some(identity) => identity,
            None => {
                debug!(
                    "旧访问令牌已失效，从刷新令牌还原身份: user_id={}",
                    claims.user_id
                );
                claims.identity()
            }
        };

        let pair = self
            .issuer
            .issue(&identity, &claims.client_type, claims.device_id.as_deref())
            .await?;

        if let Err(e) = self.store.remove(old_access).await {
            warn!(
                "⚠️ 旧访问令牌失效失败，撤销新令牌对: user_id={}, error={}",
                claims.user_id, e
            );
            if let Err(rollback) = self.revoker.logout(&pair.access_token).await {
                error!(
                    "❌ 撤销新令牌对失败: token={}, error={}",
                    mask_token(&pair.access_token),
                    rollback
                );
            }
            return Err(e);
        }

        Ok(pair)
    }

    /// 关联不存在：区分重用与普通失效
    async fn missing_link(&self, refresh_token: &str) -> Result<AuthError> {
        let Some(marker) = self.store.rotation_marker(refresh_token).await? else {
            return Ok(AuthError::invalid_token(
                TokenType::Refresh.as_str(),
                "refresh token not found or already used",
            ));
        };

        let since = (Utc::now() - marker.rotated_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if since < self.reuse_policy.grace {
            debug!(
                "并发刷新竞争失败: user_id={}, token={}",
                marker.user_id,
                mask_token(refresh_token)
            );
            return Ok(AuthError::invalid_token(
                TokenType::Refresh.as_str(),
                "refresh token already used",
            ));
        }

        metrics::record_refresh(RefreshOutcome::Reuse);
        warn!(
            "🚨 检测到刷新令牌重用: user_id={}, token={}, rotated {}s ago",
            marker.user_id,
            mask_token(refresh_token),
            since.as_secs()
        );

        if self.reuse_policy.revoke_family {
            let revoked = self.revoker.logout_all(marker.user_id).await?;
            metrics::record_revocations("reuse", revoked as u64);
            warn!(
                "🚨 已撤销用户 {} 的全部 {} 个会话（刷新令牌重用）",
                marker.user_id, revoked
            );
        }

        Ok(AuthError::invalid_token(
            TokenType::Refresh.as_str(),
            REUSE_DETECTED,
        ))
    }

    /// 批量刷新，每个刷新令牌独立处理
    pub async fn refresh_batch(
        &self,
        refresh_tokens: &[String],
    ) -> HashMap<String, Result<TokenPair>> {
        let results = join_all(refresh_tokens.iter().map(|token| self.refresh(token))).await;
        refresh_tokens.iter().cloned().zip(results).collect()
    }
}

pub(crate) const REUSE_DETECTED: &str = "refresh token reuse detected";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::{ClientType, Identity};
    use crate::config::TokenConfig;
    use crate::infra::memory_store::MemoryBackend;

    struct Fixture {
        service: Arc<TokenRefreshService>,
        issuer: Arc<TokenIssueService>,
        store: Arc<SessionStore>,
    }

    fn fixture(grace: Duration) -> Fixture {
        let config = Arc::new(TokenConfig {
            secret: "f".repeat(64),
            ..TokenConfig::default()
        });
        let jwt = Arc::new(JwtService::new(&config).unwrap());
        let store = Arc::new(SessionStore::new(
            Arc::new(MemoryBackend::new()),
            "test:",
            config.max_access_ttl(),
        ));
        let issuer = Arc::new(TokenIssueService::new(jwt.clone(), store.clone(), config));
        let revoker = Arc::new(TokenRevocationService::new(jwt.clone(), store.clone()));
        let service = Arc::new(TokenRefreshService::new(
            jwt,
            store.clone(),
            issuer.clone(),
            revoker,
            ReusePolicy {
                revoke_family: true,
                grace,
            },
        ));
        Fixture {
            service,
            issuer,
            store,
        }
    }

    #[tokio::test]
    async fn test_refresh_rotates_pair() {
        let f = fixture(Duration::from_secs(5));
        let alice = Identity::new(1, "alice");
        let first = f
            .issuer
            .issue(&alice, &ClientType::App, Some("dev-1"))
            .await
            .unwrap();

        let second = f.service.refresh(&first.refresh_token).await.unwrap();
        assert_ne!(second.access_token, first.access_token);
        assert!(!f.store.exists(&first.access_token).await.unwrap());
        assert!(f.store.exists(&second.access_token).await.unwrap());
        assert_eq!(f.store.user_tokens(1).await.unwrap(), vec![second.access_token.clone()]);

        // 同一刷新令牌只能使用一次
        let err = f.service.refresh(&first.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken { .. }));
        // 宽限期内不撤销新令牌对
        assert!(f.store.exists(&second.access_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_after_access_expired() {
        let f = fixture(Duration::from_secs(5));
        let bob = Identity::new(2, "bob").with_role("USER");
        let pair = f.issuer.issue(&bob, &ClientType::Web, None).await.unwrap();
        f.store.extend(&pair.access_token, Duration::ZERO).await.unwrap();

        let rotated = f.service.refresh(&pair.refresh_token).await.unwrap();
        assert_eq!(rotated.identity, bob);
    }

    #[tokio::test]
    async fn test_reuse_after_grace_revokes_family() {
        let f = fixture(Duration::ZERO);
        let carol = Identity::new(3, "carol");
        let first = f.issuer.issue(&carol, &ClientType::App, None).await.unwrap();
        let second = f.service.refresh(&first.refresh_token).await.unwrap();
        let other_device = f.issuer.issue(&carol, &ClientType::Web, None).await.unwrap();

        match f.service.refresh(&first.refresh_token).await {
            Err(AuthError::InvalidToken { reason, .. }) => assert_eq!(reason, REUSE_DETECTED),
            other => panic!("expected reuse rejection, got {:?}", other),
        }
        assert!(!f.store.exists(&second.access_token).await.unwrap());
        assert!(!f.store.exists(&other_device.access_token).await.unwrap());
        // 新的刷新令牌随会话一起失效
        assert!(f.service.refresh(&second.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn test_access_token_cannot_refresh() {
        let f = fixture(Duration::from_secs(5));
        let pair = f
            .issuer
            .issue(&Identity::new(4, "dave"), &ClientType::Mini, None)
            .await
            .unwrap();
        assert!(matches!(
            f.service.refresh(&pair.access_token).await,
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_concurrent_refresh_single_winner() {
        let f = fixture(Duration::from_secs(5));
        let pair = f
            .issuer
            .issue(&Identity::new(5, "erin"), &ClientType::App, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = f.service.clone();
            let token = pair.refresh_token.clone();
            handles.push(tokio::spawn(async move { service.refresh(&token).await }));
        }

        let mut winners = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(pair) => winners.push(pair),
                Err(e) => assert!(matches!(e, AuthError::InvalidToken { .. })),
            }
        }
        assert_eq!(winners.len(), 1);
        assert!(f.store.exists(&winners[0].access_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_batch_independent() {
        let f = fixture(Duration::from_secs(5));
        let pair = f
            .issuer
            .issue(&Identity::new(6, "frank"), &ClientType::Web, None)
            .await
            .unwrap();
        let tokens = vec![pair.refresh_token.clone(), "bogus".to_string()];

        let results = f.service.refresh_batch(&tokens).await;
        assert!(results[&pair.refresh_token].is_ok());
        assert!(results["bogus"].is_err());
    }
}

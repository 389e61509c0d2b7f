use crate::auth::jwt_service::JwtService;
use crate::auth::models::{mask_token, Identity, TokenStatus, TokenType, ValidationResult};
use crate::error::{AuthError, Result};
use crate::infra::metrics;
use crate::infra::session_store::SessionStore;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Token 验证服务
///
/// 签名有效只是必要条件，令牌是否存活以会话存储为准。
/// 存储不可用时返回 `Err`，不会被解释为令牌已撤销。
pub struct TokenVerifyService {
    jwt_service: Arc<JwtService>,
    store: Arc<SessionStore>,
}

impl TokenVerifyService {
    pub fn new(jwt_service: Arc<JwtService>, store: Arc<SessionStore>) -> Self {
        Self { jwt_service, store }
    }

    /// 验证访问令牌
    pub async fn verify(&self, access_token: &str) -> Result<ValidationResult> {
        let result = self.verify_inner(access_token).await?;
        metrics::record_verification(result.status.as_str());
        debug!(
            "Token 验证: token={}, status={}",
            mask_token(access_token),
            result.status
        );
        Ok(result)
    }

    async fn verify_inner(&self, access_token: &str) -> Result<ValidationResult> {
        // 1. 签名与 claims
        let claims = match self.jwt_service.parse(access_token) {
            Ok(claims) => claims,
            Err(AuthError::TokenExpired { expired_at, .. }) => {
                return Ok(ValidationResult::invalid(
                    TokenStatus::Expired,
                    format!("token expired at {}", expired_at.to_rfc3339()),
                ));
            }
            Err(AuthError::InvalidToken { reason, .. }) => {
                return Ok(ValidationResult::invalid(TokenStatus::Invalid, reason));
            }
            Err(e) => return Err(e),
        };

        if claims.token_type != TokenType::Access {
            return Ok(ValidationResult::invalid(
                TokenStatus::Invalid,
                format!("expected access token, got {}", claims.token_type),
            )
            .with_user_id(claims.user_id));
        }

        // 2. 会话存储
        match self.store.get(access_token).await? {
            Some(identity) => Ok(ValidationResult::valid(&identity)),
            None => Ok(ValidationResult::invalid(
                TokenStatus::Invalid,
                "session not found (expired or revoked)",
            )
            .with_user_id(claims.user_id)),
        }
    }

    /// 批量验证，每个令牌独立判定，互不影响
    pub async fn verify_batch(
        &self,
        tokens: &[String],
    ) -> HashMap<String, Result<ValidationResult>> {
        let results = join_all(tokens.iter().map(|token| self.verify(token))).await;
        tokens.iter().cloned().zip(results).collect()
    }

    /// 获取访问令牌对应的身份
    pub async fn get_identity(&self, access_token: &str) -> Result<Identity> {
        let claims = self
            .jwt_service
            .parse_typed(access_token, TokenType::Access)?;

        self.store.get(access_token).await?.ok_or_else(|| {
            AuthError::invalid_token(
                TokenType::Access.as_str(),
                format!("session not found for user {}", claims.user_id),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::ClientType;
    use crate::config::TokenConfig;
    use crate::infra::fault_backend::FaultBackend;
    use crate::infra::kv::KvBackend;
    use crate::infra::memory_store::MemoryBackend;
    use chrono::Duration;

    fn setup() -> (TokenVerifyService, Arc<SessionStore>, Arc<JwtService>) {
        setup_with(Arc::new(MemoryBackend::new()))
    }

    fn setup_with(
        backend: Arc<dyn KvBackend>,
    ) -> (TokenVerifyService, Arc<SessionStore>, Arc<JwtService>) {
        let config = TokenConfig {
            secret: "v".repeat(64),
            ..TokenConfig::default()
        };
        let jwt = Arc::new(JwtService::new(&config).unwrap());
        let store = Arc::new(SessionStore::new(backend, "test:", config.max_access_ttl()));
        (TokenVerifyService::new(jwt.clone(), store.clone()), store, jwt)
    }

    async fn live_token(store: &SessionStore, jwt: &JwtService, identity: &Identity) -> String {
        let token = jwt
            .generate(identity, TokenType::Access, &ClientType::Web, None, Duration::hours(1))
            .unwrap();
        store
            .put(&token, identity, None, std::time::Duration::from_secs(3600))
            .await
            .unwrap();
        token
    }

    #[tokio::test]
    async fn test_verify_valid_and_missing_session() {
        let (service, store, jwt) = setup();
        let alice = Identity::new(5, "alice").with_permission("doc:read");
        let token = live_token(&store, &jwt, &alice).await;

        let result = service.verify(&token).await.unwrap();
        assert!(result.valid);
        assert_eq!(result.status, TokenStatus::Valid);
        assert_eq!(result.user_id, Some(5));
        assert!(result.permissions.contains("doc:read"));

        store.remove(&token).await.unwrap();
        let result = service.verify(&token).await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.status, TokenStatus::Invalid);
    }

    #[tokio::test]
    async fn test_verify_expired_and_garbage() {
        let (service, _, jwt) = setup();
        let alice = Identity::new(5, "alice");
        let expired = jwt
            .generate(&alice, TokenType::Access, &ClientType::Web, None, Duration::seconds(-5))
            .unwrap();

        assert_eq!(
            service.verify(&expired).await.unwrap().status,
            TokenStatus::Expired
        );
        assert_eq!(
            service.verify("not-a-token").await.unwrap().status,
            TokenStatus::Invalid
        );
    }

    #[tokio::test]
    async fn test_refresh_token_is_not_an_access_token() {
        let (service, _, jwt) = setup();
        let refresh = jwt
            .generate(
                &Identity::new(5, "alice"),
                TokenType::Refresh,
                &ClientType::Web,
                None,
                Duration::days(1),
            )
            .unwrap();
        let result = service.verify(&refresh).await.unwrap();
        assert_eq!(result.status, TokenStatus::Invalid);
        assert!(service.get_identity(&refresh).await.is_err());
    }

    #[tokio::test]
    async fn test_get_identity() {
        let (service, store, jwt) = setup();
        let bob = Identity::new(6, "bob").with_role("ADMIN");
        let token = live_token(&store, &jwt, &bob).await;

        assert_eq!(service.get_identity(&token).await.unwrap(), bob);
        store.remove(&token).await.unwrap();
        assert!(matches!(
            service.get_identity(&token).await,
            Err(AuthError::InvalidToken { .. })
        ));
    }

    #[tokio::test]
    async fn test_store_failure_is_an_error_not_a_verdict() {
        let backend = Arc::new(FaultBackend::new());
        let (service, store, jwt) = setup_with(backend.clone());
        let alice = Identity::new(5, "alice");
        let healthy = live_token(&store, &jwt, &alice).await;
        let unreachable = live_token(&store, &jwt, &alice).await;
        backend.fail_get_for(unreachable.clone());

        let err = service.verify(&unreachable).await.unwrap_err();
        assert!(matches!(err, AuthError::Store(_)));
        assert!(err.is_infrastructure());
        assert!(service.get_identity(&unreachable).await.unwrap_err().is_infrastructure());

        let results = service
            .verify_batch(&[unreachable.clone(), healthy.clone()])
            .await;
        assert_eq!(results.len(), 2);
        assert!(matches!(results[&unreachable], Err(AuthError::Store(_))));
        let ok = results[&healthy].as_ref().unwrap();
        assert!(ok.valid);
        assert_eq!(ok.status, TokenStatus::Valid);
    }
}

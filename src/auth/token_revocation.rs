use crate::auth::jwt_service::JwtService;
use crate::auth::models::mask_token;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::session_store::SessionStore;
use std::sync::Arc;
use tracing::{debug, info};

/// Token 撤销服务
pub struct TokenRevocationService {
    jwt_service: Arc<JwtService>,
    store: Arc<SessionStore>,
}

impl TokenRevocationService {
    pub fn new(jwt_service: Arc<JwtService>, store: Arc<SessionStore>) -> Self {
        Self { jwt_service, store }
    }

    /// 注销单个访问令牌，同时撤销与之配对的刷新令牌
    ///
    /// 幂等：令牌不存在、已过期或已注销都返回成功；只有存储不可用时返回错误。
    /// 访问令牌已过期时仍会撤销其刷新令牌，注销后的会话不能再通过刷新恢复。
    pub async fn logout(&self, access_token: &str) -> Result<bool> {
        match self.store.remove(access_token).await? {
            Some(identity) => {
                metrics::record_revocations("single", 1);
                info!(
                    "✅ 已注销 token: user_id={}, token={}",
                    identity.user_id,
                    mask_token(access_token)
                );
            }
            None => {
                // 会话已被动过期时，索引成员和刷新令牌可能还在
                if let Ok(claims) = self.jwt_service.parse_allow_expired(access_token) {
                    self.store.unindex(claims.user_id, access_token).await?;
                    let revoked = self
                        .store
                        .revoke_refresh_for(claims.user_id, access_token)
                        .await?;
                    if revoked > 0 {
                        metrics::record_revocations("single", revoked as u64);
                        info!(
                            "✅ 访问令牌已过期，已撤销其刷新令牌: user_id={}, token={}",
                            claims.user_id,
                            mask_token(access_token)
                        );
                        return Ok(true);
                    }
                }
                debug!("token 已失效，忽略注销: token={}", mask_token(access_token));
            }
        }
        Ok(true)
    }

    /// 注销用户的全部会话，返回注销数量
    pub async fn logout_all(&self, user_id: u64) -> Result<usize> {
        debug!("撤销用户所有 token: user_id={}", user_id);

        let count = self.store.remove_all(user_id).await?;
        metrics::record_revocations("all", count as u64);
        info!("✅ 已撤销用户 {} 的所有 {} 个会话", user_id, count);

        Ok(count)
    }
}

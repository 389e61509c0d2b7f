// SessionStore - 会话存储
// 访问令牌 → 身份快照、用户令牌索引、刷新令牌关联及其用户索引、刷新重用标记

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::models::{mask_token, Identity, SessionRecord};
use crate::error::Result;
use crate::infra::kv::{KeyTtl, KvBackend};

const ACCESS_TOKEN_KEY: &str = "access_token:";
const REFRESH_TOKEN_KEY: &str = "refresh_token:";
const USER_TOKENS_KEY: &str = "user_tokens:";
const REFRESH_ROTATED_KEY: &str = "refresh_rotated:";
const USER_REFRESH_KEY: &str = "user_refresh:";

/// 刷新索引成员 `<access> <refresh>` 的分隔符，JWT 中不会出现空格
const PAIR_SEPARATOR: char = ' ';

fn pair_member(access_token: &str, refresh_token: &str) -> String {
    format!("{}{}{}", access_token, PAIR_SEPARATOR, refresh_token)
}

pub(crate) fn split_pair(member: &str) -> Option<(&str, &str)> {
    member.split_once(PAIR_SEPARATOR)
}

/// 刷新令牌轮换标记：所属用户和轮换时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationMarker {
    pub user_id: u64,
    pub rotated_at: DateTime<Utc>,
}

impl RotationMarker {
    fn encode(&self) -> String {
        format!("{}:{}", self.user_id, self.rotated_at.timestamp_millis())
    }

    fn decode(value: &str) -> Option<Self> {
        let (user_id, millis) = value.split_once(':')?;
        Some(Self {
            user_id: user_id.parse().ok()?,
            rotated_at: Utc.timestamp_millis_opt(millis.parse().ok()?).single()?,
        })
    }
}

/// 会话存储
///
/// 存储是令牌是否存活的唯一依据：签名有效但不在存储中的令牌视为无效。
/// 所有并发正确性都依赖后端的单 key 原子操作，本身不持有锁。
pub struct SessionStore {
    backend: Arc<dyn KvBackend>,
    key_prefix: String,
    /// 用户令牌索引 TTL 的下限（所有客户端类型中最长的访问令牌有效期）
    index_ttl_floor: Duration,
}

impl SessionStore {
    pub fn new(
        backend: Arc<dyn KvBackend>,
        key_prefix: impl Into<String>,
        index_ttl_floor: Duration,
    ) -> Self {
        Self {
            backend,
            key_prefix: key_prefix.into(),
            index_ttl_floor,
        }
    }

    fn access_key(&self, token: &str) -> String {
        format!("{}{}{}", self.key_prefix, ACCESS_TOKEN_KEY, token)
    }

    fn refresh_key(&self, refresh_token: &str) -> String {
        format!("{}{}{}", self.key_prefix, REFRESH_TOKEN_KEY, refresh_token)
    }

    fn rotated_key(&self, refresh_token: &str) -> String {
        format!("{}{}{}", self.key_prefix, REFRESH_ROTATED_KEY, refresh_token)
    }

    pub(crate) fn index_key(&self, user_id: u64) -> String {
        format!("{}{}{}", self.key_prefix, USER_TOKENS_KEY, user_id)
    }

    fn refresh_index_key(&self, user_id: u64) -> String {
        format!("{}{}{}", self.key_prefix, USER_REFRESH_KEY, user_id)
    }

    /// 用户令牌索引的扫描模式
    pub(crate) fn index_pattern(&self) -> String {
        format!("{}{}*", self.key_prefix, USER_TOKENS_KEY)
    }

    /// 用户刷新令牌索引的扫描模式
    pub(crate) fn refresh_index_pattern(&self) -> String {
        format!("{}{}*", self.key_prefix, USER_REFRESH_KEY)
    }

    /// 索引 TTL：不小于任何成员的 TTL
    fn index_ttl(&self, member_ttl: Duration) -> Duration {
        self.index_ttl_floor.max(member_ttl)
    }

    // ============================================================
    // 会话记录
    // ============================================================

    /// 写入会话记录并加入用户令牌索引（单次原子提交）
    pub async fn put(
        &self,
        token: &str,
        identity: &Identity,
        refresh_token: Option<&str>,
        ttl: Duration,
    ) -> Result<()> {
        let record = SessionRecord {
            identity: identity.clone(),
            refresh_token: refresh_token.map(str::to_string),
        };
        let value = serde_json::to_string(&record)?;

        self.backend
            .set_ex_indexed(
                &self.access_key(token),
                &value,
                ttl,
                &self.index_key(identity.user_id),
                token,
                self.index_ttl(ttl),
            )
            .await?;

        debug!(
            "会话已写入: user_id={}, token={}, ttl={}s",
            identity.user_id,
            mask_token(token),
            ttl.as_secs()
        );
        Ok(())
    }

    pub async fn get_record(&self, token: &str) -> Result<Option<SessionRecord>> {
        match self.backend.get(&self.access_key(token)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    /// 读取身份快照，None 表示已过期或已撤销
    pub async fn get(&self, token: &str) -> Result<Option<Identity>> {
        Ok(self.get_record(token).await?.map(|r| r.identity))
    }

    /// 删除会话记录、索引成员以及与之配对的刷新令牌关联
    pub async fn remove(&self, token: &str) -> Result<Option<Identity>> {
        let Some(value) = self.backend.get_del(&self.access_key(token)).await? else {
            return Ok(None);
        };

        let record: SessionRecord = serde_json::from_str(&value)?;
        let user_id = record.identity.user_id;
        self.unindex(user_id, token).await?;
        match &record.refresh_token {
            Some(refresh_token) => {
                self.unlink_refresh_pair(user_id, token, refresh_token).await?;
            }
            None => {
                self.revoke_refresh_for(user_id, token).await?;
            }
        }

        debug!(
            "会话已删除: user_id={}, token={}",
            record.identity.user_id,
            mask_token(token)
        );
        Ok(Some(record.identity))
    }

    /// 仅从用户令牌索引中移除成员
    pub async fn unindex(&self, user_id: u64, token: &str) -> Result<bool> {
        self.backend.srem(&self.index_key(user_id), token).await
    }

    /// 删除用户的全部会话，包括访问令牌已被动过期、刷新令牌仍然有效的会话
    ///
    /// 基于索引快照逐个删除；期间新签发的令牌可能不在快照中而存活下来。
    pub async fn remove_all(&self, user_id: u64) -> Result<usize> {
        let tokens = self.user_tokens(user_id).await?;
        let mut removed = 0;
        for token in &tokens {
            if self.remove(token).await?.is_some() {
                removed += 1;
            } else {
                // 已被动过期的成员顺手清掉
                self.unindex(user_id, token).await?;
            }
        }

        // 存活会话的刷新令牌已随 remove 删除，剩下的都属于访问令牌已过期的会话
        for member in self.refresh_pairs(user_id).await? {
            let revoked = match split_pair(&member) {
                Some((access, refresh)) => self.unlink_refresh_pair(user_id, access, refresh).await?,
                None => {
                    self.backend
                        .srem(&self.refresh_index_key(user_id), &member)
                        .await?;
                    false
                }
            };
            if revoked {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn exists(&self, token: &str) -> Result<bool> {
        self.backend.exists(&self.access_key(token)).await
    }

    /// 重设会话的有效期，ttl 为 0 时立即失效；返回会话是否存在
    pub async fn extend(&self, token: &str, ttl: Duration) -> Result<bool> {
        if ttl.is_zero() {
            return self.backend.expire(&self.access_key(token), ttl).await;
        }

        let Some(identity) = self.get(token).await? else {
            return Ok(false);
        };
        if !self.backend.expire(&self.access_key(token), ttl).await? {
            return Ok(false);
        }

        // 索引 TTL 只增不减
        let index_key = self.index_key(identity.user_id);
        if self.backend.ttl(&index_key).await? == KeyTtl::Missing {
            warn!(
                "⚠️ 用户令牌索引缺失，重建: user_id={}, token={}",
                identity.user_id,
                mask_token(token)
            );
            self.backend.sadd(&index_key, token).await?;
        }
        self.backend
            .expire_at_least(&index_key, self.index_ttl(ttl))
            .await?;
        Ok(true)
    }

    /// 会话剩余有效期，None 表示不存在
    pub async fn ttl_remaining(&self, token: &str) -> Result<Option<Duration>> {
        Ok(match self.backend.ttl(&self.access_key(token)).await? {
            KeyTtl::Missing => None,
            KeyTtl::Persistent => Some(Duration::MAX),
            KeyTtl::Expires(d) => Some(d),
        })
    }

    /// 用户当前索引中的访问令牌
    pub async fn user_tokens(&self, user_id: u64) -> Result<Vec<String>> {
        self.backend.smembers(&self.index_key(user_id)).await
    }

    // ============================================================
    // 刷新令牌关联
    // ============================================================

    /// 写入刷新令牌关联，并以 `<access> <refresh>` 加入用户刷新索引（单次原子提交）
    ///
    /// 刷新索引的存活时间跟随刷新令牌而不是访问令牌，
    /// 访问令牌被动过期后仍能通过它找到并撤销刷新令牌。
    pub async fn put_refresh_link(
        &self,
        refresh_token: &str,
        access_token: &str,
        user_id: u64,
        ttl: Duration,
    ) -> Result<()> {
        self.backend
            .set_ex_indexed(
                &self.refresh_key(refresh_token),
                access_token,
                ttl,
                &self.refresh_index_key(user_id),
                &pair_member(access_token, refresh_token),
                ttl,
            )
            .await
    }

    /// 原子地取出并删除刷新令牌关联；并发调用中只有一个能拿到
    pub async fn take_refresh_link(&self, refresh_token: &str) -> Result<Option<String>> {
        self.backend.get_del(&self.refresh_key(refresh_token)).await
    }

    pub async fn refresh_link(&self, refresh_token: &str) -> Result<Option<String>> {
        self.backend.get(&self.refresh_key(refresh_token)).await
    }

    pub(crate) async fn refresh_link_exists(&self, refresh_token: &str) -> Result<bool> {
        self.backend.exists(&self.refresh_key(refresh_token)).await
    }

    /// 用户刷新索引中的 `<access> <refresh>` 成员
    pub(crate) async fn refresh_pairs(&self, user_id: u64) -> Result<Vec<String>> {
        self.backend.smembers(&self.refresh_index_key(user_id)).await
    }

    /// 删除刷新令牌关联及其刷新索引成员，返回关联是否还存在
    pub async fn unlink_refresh_pair(
        &self,
        user_id: u64,
        access_token: &str,
        refresh_token: &str,
    ) -> Result<bool> {
        let existed = self.backend.del(&self.refresh_key(refresh_token)).await?;
        self.backend
            .srem(
                &self.refresh_index_key(user_id),
                &pair_member(access_token, refresh_token),
            )
            .await?;
        Ok(existed)
    }

    /// 撤销与访问令牌配对的刷新令牌，不依赖会话记录是否还存在
    pub async fn revoke_refresh_for(&self, user_id: u64, access_token: &str) -> Result<usize> {
        let mut revoked = 0;
        for member in self.refresh_pairs(user_id).await? {
            let Some((access, refresh)) = split_pair(&member) else {
                continue;
            };
            if access == access_token
                && self.unlink_refresh_pair(user_id, access, refresh).await?
            {
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    /// 记录已轮换的刷新令牌，用于重用检测
    pub async fn mark_refresh_rotated(
        &self,
        refresh_token: &str,
        user_id: u64,
        ttl: Duration,
    ) -> Result<()> {
        if ttl.is_zero() {
            return Ok(());
        }
        let marker = RotationMarker {
            user_id,
            rotated_at: Utc::now(),
        };
        self.backend
            .set_ex(&self.rotated_key(refresh_token), &marker.encode(), ttl)
            .await
    }

    /// 已轮换刷新令牌的重用标记
    pub async fn rotation_marker(&self, refresh_token: &str) -> Result<Option<RotationMarker>> {
        Ok(self
            .backend
            .get(&self.rotated_key(refresh_token))
            .await?
            .and_then(|v| RotationMarker::decode(&v)))
    }

    // ============================================================
    // 清理
    // ============================================================

    /// 游标扫描索引 key
    pub(crate) async fn scan_indexes(
        &self,
        pattern: &str,
        cursor: u64,
        count: usize,
    ) -> Result<(u64, Vec<String>)> {
        self.backend.scan(cursor, pattern, count).await
    }

    pub(crate) async fn index_members(&self, index_key: &str) -> Result<Vec<String>> {
        self.backend.smembers(index_key).await
    }

    pub(crate) async fn prune_index_member(&self, index_key: &str, token: &str) -> Result<bool> {
        self.backend.srem(index_key, token).await
    }
}

// 测试用存储后端：包装 MemoryBackend，按配置注入存储故障

use async_trait::async_trait;
use parking_lot::RwLock;
use std::time::Duration;

use crate::error::{AuthError, Result};
use crate::infra::kv::{KeyTtl, KvBackend};
use crate::infra::memory_store::MemoryBackend;

#[derive(Debug, Default)]
pub(crate) struct FaultBackend {
    inner: MemoryBackend,
    /// 刷新令牌关联（写入 user_refresh 索引的原子提交）失败
    fail_refresh_links: bool,
    /// key 包含该片段时 GET 失败
    fail_get_for: RwLock<Option<String>>,
    /// 每页 SCAN 结果重复返回一次（Redis SCAN 允许重复）
    duplicate_scan: bool,
}

impl FaultBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_refresh_links(mut self) -> Self {
        self.fail_refresh_links = true;
        self
    }

    pub(crate) fn duplicating_scan(mut self) -> Self {
        self.duplicate_scan = true;
        self
    }

    pub(crate) fn fail_get_for(&self, needle: impl Into<String>) {
        *self.fail_get_for.write() = Some(needle.into());
    }

    fn unavailable(op: &str, key: &str) -> AuthError {
        AuthError::Store(format!("{} refused: {}", op, key))
    }
}

#[async_trait]
impl KvBackend for FaultBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let poisoned = self
            .fail_get_for
            .read()
            .as_deref()
            .map(|needle| key.contains(needle))
            .unwrap_or(false);
        if poisoned {
            return Err(Self::unavailable("GET", key));
        }
        self.inner.get(key).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        self.inner.get_del(key).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        self.inner.ttl(key).await
    }

    async fn expire_at_least(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.inner.expire_at_least(key, ttl).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.inner.sadd(key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.srem(key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.inner.smembers(key).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let (next, keys) = self.inner.scan(cursor, pattern, count).await?;
        if !self.duplicate_scan {
            return Ok((next, keys));
        }
        let doubled = keys.iter().chain(keys.iter()).cloned().collect();
        Ok((next, doubled))
    }

    async fn set_ex_indexed(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        set_key: &str,
        member: &str,
        set_ttl: Duration,
    ) -> Result<()> {
        if self.fail_refresh_links && set_key.contains("user_refresh:") {
            return Err(Self::unavailable("MULTI", key));
        }
        self.inner
            .set_ex_indexed(key, value, ttl, set_key, member, set_ttl)
            .await
    }
}

// 会话存储后端抽象
// 只暴露单 key / 单集合的原子原语，并发正确性由后端保证

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::infra::redis::RedisClient;

/// Key 的剩余生存时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// key 不存在（已过期或已删除）
    Missing,
    /// key 存在但没有过期时间
    Persistent,
    /// 剩余生存时间
    Expires(Duration),
}

impl KeyTtl {
    /// 从 Redis TTL 返回值解析（-2 不存在，-1 永不过期）
    pub fn from_redis(ttl: i64) -> Self {
        match ttl {
            -2 => KeyTtl::Missing,
            t if t < 0 => KeyTtl::Persistent,
            t => KeyTtl::Expires(Duration::from_secs(t as u64)),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        match self {
            KeyTtl::Expires(d) => Some(*d),
            _ => None,
        }
    }
}

/// 分布式键值存储后端
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// SET key value EX ttl
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// GET key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// 原子地读取并删除，多个并发调用中只有一个能拿到值
    async fn get_del(&self, key: &str) -> Result<Option<String>>;

    /// DEL key，返回是否删除了 key
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// 重设过期时间，ttl 为 0 时立即删除；返回 key 是否存在
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn ttl(&self, key: &str) -> Result<KeyTtl>;

    /// 只延长不缩短：没有过期时间时直接设置，否则取较晚的过期时间；返回 key 是否存在
    async fn expire_at_least(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// SREM key member，返回成员是否存在
    async fn srem(&self, key: &str, member: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// 游标扫描，pattern 只支持尾部 `*`；返回的游标为 0 表示扫描结束
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)>;

    /// 原子写入：SET key value EX ttl + SADD set_key member，
    /// 集合过期时间按 [`KvBackend::expire_at_least`] 的语义只增不减
    async fn set_ex_indexed(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        set_key: &str,
        member: &str,
        set_ttl: Duration,
    ) -> Result<()>;
}

/// Redis 的秒级 TTL，向上取整避免 0 秒立即删除
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

#[async_trait]
impl KvBackend for RedisClient {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        RedisClient::set_ex(self, key, value, ttl_secs(ttl).max(1)).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        RedisClient::get(self, key).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        RedisClient::get_del(self, key).await
    }

    async fn del(&self, key: &str) -> Result<bool> {
        RedisClient::del(self, key).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        RedisClient::exists(self, key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        RedisClient::expire(self, key, ttl_secs(ttl)).await
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        Ok(KeyTtl::from_redis(RedisClient::ttl(self, key).await?))
    }

    async fn expire_at_least(&self, key: &str, ttl: Duration) -> Result<bool> {
        let secs = ttl_secs(ttl);
        if secs == 0 {
            return RedisClient::exists(self, key).await;
        }
        RedisClient::expire_raise(self, key, secs).await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        RedisClient::sadd(self, key, member).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        RedisClient::srem(self, key, member).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        RedisClient::smembers(self, key).await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        RedisClient::scan(self, cursor, pattern, count).await
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
        RedisClient::set_ex_with_member(
            self,
            key,
            value,
            ttl_secs(ttl).max(1),
            set_key,
            member,
            ttl_secs(set_ttl).max(1),
        )
        .await
    }
}

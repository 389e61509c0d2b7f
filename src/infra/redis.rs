// RedisClient - Redis客户端实现
// 基于 bb8-redis 连接池

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;

use crate::config::RedisConfig;
use crate::error::{AuthError, Result};

/// Redis 客户端（基于连接池）
pub struct RedisClient {
    pool: Arc<Pool<RedisConnectionManager>>,
    /// 单条 Redis 命令的执行超时
    command_timeout: Duration,
}

impl RedisClient {
    /// 创建新的 Redis 客户端（从 RedisConfig 配置）
    pub async fn new(config: &RedisConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.url.clone())
            .map_err(|e| AuthError::Store(format!("Failed to create Redis manager: {}", e)))?;

        let pool = Pool::builder()
            .max_size(config.pool_size)
            .min_idle(Some(config.min_idle))
            .connection_timeout(config.connection_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .build(manager)
            .await
            .map_err(|e| AuthError::Store(format!("Failed to create Redis pool: {}", e)))?;

        let command_timeout = config.command_timeout();

        // 测试连接
        {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| AuthError::Store(format!("Failed to get Redis connection: {}", e)))?;

            let _: String = conn
                .ping()
                .await
                .map_err(|e| AuthError::Store(format!("Redis ping failed: {}", e)))?;
        }

        tracing::info!(
            "✅ Redis 连接池已创建 (pool_size={}, min_idle={}, conn_timeout={}s, cmd_timeout={}ms, idle_timeout={}s)",
            config.pool_size,
            config.min_idle,
            config.connection_timeout_secs,
            config.command_timeout_ms,
            config.idle_timeout_secs,
        );

        Ok(Self {
            pool: Arc::new(pool),
            command_timeout,
        })
    }

    /// 获取连接池状态（活跃连接数、空闲连接数）
    pub fn pool_state(&self) -> bb8::State {
        self.pool.state()
    }

    /// 从连接池获取连接
    async fn get_conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>> {
        self.pool
            .get()
            .await
            .map_err(|e| AuthError::Store(format!("Failed to get Redis connection: {}", e)))
    }

    /// 执行带超时的 Redis 操作
    async fn with_timeout<F, T>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.command_timeout, op)
            .await
            .map_err(|_| {
                AuthError::Store(format!(
                    "Redis command timeout ({}ms)",
                    self.command_timeout.as_millis()
                ))
            })?
    }

    // ============================================================
    // String 操作
    // ============================================================

    /// SET key value EX seconds
    pub async fn set_ex(&self, key: &str, value: &str, seconds: u64) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.set_ex::<_, _, ()>(key, value, seconds)
                .await
                .map_err(|e| AuthError::Store(format!("Redis SETEX failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// GET key
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Option<String> = conn
                .get(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis GET failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    /// GETDEL key - 原子地读取并删除
    pub async fn get_del(&self, key: &str) -> Result<Option<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Option<String> = conn
                .get_del(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis GETDEL failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    /// DEL key，返回是否删除了 key
    pub async fn del(&self, key: &str) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let removed: usize = conn
                .del(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis DEL failed: {}", e)))?;
            Ok(removed > 0)
        })
        .await
    }

    /// EXISTS key - 检查 key 是否存在
    pub async fn exists(&self, key: &str) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: bool = conn
                .exists(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis EXISTS failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    /// EXPIRE key seconds，seconds 为 0 时 key 被立即删除
    pub async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let applied: bool = conn
                .expire(key, seconds as i64)
                .await
                .map_err(|e| AuthError::Store(format!("Redis EXPIRE failed: {}", e)))?;
            Ok(applied)
        })
        .await
    }

    /// EXPIRE key seconds NX + EXPIRE key seconds GT：过期时间只增不减（需要 Redis 7.0+）
    pub async fn expire_raise(&self, key: &str, seconds: u64) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .exists(key)
                .cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .arg("NX")
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(seconds)
                .arg("GT")
                .ignore();
            let (exists,): (bool,) = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| AuthError::Store(format!("Redis EXPIRE NX/GT failed: {}", e)))?;
            Ok(exists)
        })
        .await
    }

    /// TTL key：-2 表示不存在，-1 表示永不过期
    pub async fn ttl(&self, key: &str) -> Result<i64> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let ttl: i64 = conn
                .ttl(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis TTL failed: {}", e)))?;
            Ok(ttl)
        })
        .await
    }

    /// SCAN cursor MATCH pattern COUNT count
    pub async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count);
            let result: (u64, Vec<String>) = cmd
                .query_async(&mut *conn)
                .await
                .map_err(|e| AuthError::Store(format!("Redis SCAN failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    // ============================================================
    // Set 操作
    // ============================================================

    /// SADD key member
    pub async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            conn.sadd::<_, _, ()>(key, member)
                .await
                .map_err(|e| AuthError::Store(format!("Redis SADD failed: {}", e)))?;
            Ok(())
        })
        .await
    }

    /// SREM key member，返回成员是否存在
    pub async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let removed: usize = conn
                .srem(key, member)
                .await
                .map_err(|e| AuthError::Store(format!("Redis SREM failed: {}", e)))?;
            Ok(removed > 0)
        })
        .await
    }

    /// SMEMBERS key
    pub async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let result: Vec<String> = conn
                .smembers(key)
                .await
                .map_err(|e| AuthError::Store(format!("Redis SMEMBERS failed: {}", e)))?;
            Ok(result)
        })
        .await
    }

    // ============================================================
    // 事务操作
    // ============================================================

    /// MULTI; SET key value EX ttl; SADD set_key member; EXPIRE set_key set_ttl NX; EXPIRE set_key set_ttl GT; EXEC
    ///
    /// 集合的过期时间只增不减，新写入的成员不会让集合早于已有成员过期。
    pub async fn set_ex_with_member(
        &self,
        key: &str,
        value: &str,
        seconds: u64,
        set_key: &str,
        member: &str,
        set_seconds: u64,
    ) -> Result<()> {
        self.with_timeout(async {
            let mut conn = self.get_conn().await?;
            let mut pipe = redis::pipe();
            pipe.atomic()
                .set_ex(key, value, seconds)
                .ignore()
                .sadd(set_key, member)
                .ignore()
                .cmd("EXPIRE")
                .arg(set_key)
                .arg(set_seconds)
                .arg("NX")
                .ignore()
                .cmd("EXPIRE")
                .arg(set_key)
                .arg(set_seconds)
                .arg("GT")
                .ignore();
            let _: () = pipe
                .query_async(&mut *conn)
                .await
                .map_err(|e| AuthError::Store(format!("Redis MULTI/EXEC failed: {}", e)))?;
            Ok(())
        })
        .await
    }
}

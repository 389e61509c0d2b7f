// MemoryBackend - 进程内会话存储
// 用于单机部署和测试，语义与 Redis 后端保持一致（惰性过期）

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::infra::kv::{KeyTtl, KvBackend};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    /// 创建序号，作为扫描游标，删除其他 key 不影响扫描进度
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// 基于 DashMap 的内存后端
///
/// 每个 key 的读改写都在 DashMap 分片锁内完成，`get_del` 因此对并发调用者是原子的。
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
    next_seq: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前未过期的 key 数量
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 删除所有已过期的 key
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }

    fn seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 读取未过期的条目，过期的顺手删掉
    fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(now) {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry)
    }

    fn set_str(&self, key: &str, value: &str, ttl: Duration) {
        if ttl.is_zero() {
            self.entries.remove(key);
            return;
        }
        self.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
                seq: self.seq(),
            },
        );
    }

    fn add_member(&self, key: &str, member: &str) {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.is_expired(now) {
                    *entry = Entry {
                        value: Value::Set(HashSet::new()),
                        expires_at: None,
                        seq: self.seq(),
                    };
                }
                match &mut entry.value {
                    Value::Set(set) => {
                        set.insert(member.to_string());
                    }
                    // 类型冲突时与 Redis 不同，直接覆盖为集合
                    Value::Str(_) => {
                        entry.value = Value::Set(HashSet::from([member.to_string()]));
                    }
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    value: Value::Set(HashSet::from([member.to_string()])),
                    expires_at: None,
                    seq: self.seq(),
                });
            }
        }
    }

    fn set_expiry(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        if ttl.is_zero() {
            return self
                .entries
                .remove_if(key, |_, e| !e.is_expired(now))
                .is_some();
        }
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }
}

impl MemoryBackend {
    /// 过期时间只增不减，与 Redis 的 `EXPIRE NX` + `EXPIRE GT` 组合一致
    fn raise_expiry(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                if !ttl.is_zero() {
                    let wanted = now + ttl;
                    entry.expires_at = Some(match entry.expires_at {
                        Some(at) => at.max(wanted),
                        None => wanted,
                    });
                }
                true
            }
            _ => false,
        }
    }
}

/// 只支持 `prefix*` 和完全匹配两种模式
fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.set_str(key, value, ttl);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(match self.live_entry(key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Some(s),
            _ => None,
        })
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let removed = self.entries.remove_if(key, |_, e| {
            !e.is_expired(now) && matches!(e.value, Value::Str(_))
        });
        Ok(match removed {
            Some((
                _,
                Entry {
                    value: Value::Str(s),
                    ..
                },
            )) => Some(s),
            _ => None,
        })
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .remove(key)
            .map(|(_, e)| !e.is_expired(now))
            .unwrap_or(false))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.live_entry(key).is_some())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.set_expiry(key, ttl))
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let now = Instant::now();
        Ok(match self.live_entry(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(at),
                ..
            }) => KeyTtl::Expires(at.saturating_duration_since(now)),
        })
    }

    async fn expire_at_least(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.raise_expiry(key, ttl))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        self.add_member(key, member);
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        let removed = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                Value::Set(set) => set.remove(member),
                Value::Str(_) => false,
            },
            _ => false,
        };
        // 空集合不保留
        self.entries
            .remove_if(key, |_, e| matches!(&e.value, Value::Set(s) if s.is_empty()));
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        Ok(match self.live_entry(key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.into_iter().collect(),
            _ => Vec::new(),
        })
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<(u64, Vec<String>)> {
        let now = Instant::now();
        let mut keys: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|e| e.seq >= cursor && !e.is_expired(now) && matches_pattern(e.key(), pattern))
            .map(|e| (e.seq, e.key().clone()))
            .collect();
        keys.sort_unstable();

        let count = count.max(1);
        if keys.len() <= count {
            return Ok((0, keys.into_iter().map(|(_, k)| k).collect()));
        }
        let next = keys[count].0;
        keys.truncate(count);
        Ok((next, keys.into_iter().map(|(_, k)| k).collect()))
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
        self.set_str(key, value, ttl);
        self.add_member(set_key, member);
        self.raise_expiry(set_key, set_ttl);
        Ok(())
    }
}

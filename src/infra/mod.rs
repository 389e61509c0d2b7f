// Infrastructure layer - 基础设施层
// 负责会话存储后端（Redis / 内存）、会话存储、索引清理与指标

pub mod cleanup_worker;
#[cfg(test)]
pub(crate) mod fault_backend;
pub mod kv;
pub mod memory_store;
pub mod metrics;
pub mod redis;
pub mod session_store;

// 重新导出主要类型
pub use self::cleanup_worker::CleanupWorker;
pub use self::kv::{KeyTtl, KvBackend};
pub use self::memory_store::MemoryBackend;
pub use self::redis::RedisClient;
pub use self::session_store::SessionStore;

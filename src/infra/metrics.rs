//! 令牌生命周期指标：签发量、验证结果分布、刷新结果、撤销与清理量
//!
//! 只通过 `metrics` facade 记录，exporter 由宿主进程自行安装；未安装 Recorder 时所有调用都是空操作。

/// 指标名称
const COUNTER_TOKENS_ISSUED: &str = "tokengate_tokens_issued_total";
const COUNTER_VERIFICATIONS: &str = "tokengate_verifications_total";
const COUNTER_REFRESHES: &str = "tokengate_refreshes_total";
const COUNTER_REVOCATIONS: &str = "tokengate_revocations_total";
const COUNTER_CLEANUP_REMOVED: &str = "tokengate_cleanup_removed_total";
const GAUGE_REDIS_POOL_ACTIVE: &str = "tokengate_redis_pool_active";
const GAUGE_REDIS_POOL_IDLE: &str = "tokengate_redis_pool_idle";

/// 刷新结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Ok,
    Rejected,
    Reuse,
}

impl RefreshOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshOutcome::Ok => "ok",
            RefreshOutcome::Rejected => "rejected",
            RefreshOutcome::Reuse => "reuse",
        }
    }
}

/// 记录一次令牌签发（按客户端类型）
pub fn record_issued(client_type: &str) {
    metrics::counter!(COUNTER_TOKENS_ISSUED, "client_type" => client_type.to_string()).increment(1);
}

/// 记录一次验证结果（按状态）
pub fn record_verification(status: &str) {
    metrics::counter!(COUNTER_VERIFICATIONS, "status" => status.to_string()).increment(1);
}

pub fn record_refresh(outcome: RefreshOutcome) {
    metrics::counter!(COUNTER_REFRESHES, "outcome" => outcome.as_str()).increment(1);
}

/// 记录撤销的会话数（scope: single / all / reuse）
pub fn record_revocations(scope: &'static str, count: u64) {
    metrics::counter!(COUNTER_REVOCATIONS, "scope" => scope).increment(count);
}

pub fn record_cleanup_removed(count: u64) {
    metrics::counter!(COUNTER_CLEANUP_REMOVED).increment(count);
}

/// 更新 Redis 连接池状态（Gauge）。
pub fn record_redis_pool(active: u32, idle: u32) {
    metrics::gauge!(GAUGE_REDIS_POOL_ACTIVE).set(active as f64);
    metrics::gauge!(GAUGE_REDIS_POOL_IDLE).set(idle as f64);
}

// CleanupWorker - 用户令牌索引清理任务
// 周期性地扫描 user_tokens 索引，移除底层会话已被动过期的悬挂成员

use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::auth::models::{mask_token, CleanupReport};
use crate::config::CleanupConfig;
use crate::error::Result;
use crate::infra::metrics;
use crate::infra::session_store::{split_pair, SessionStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexKind {
    /// user_tokens:<uid>，成员是访问令牌
    Sessions,
    /// user_refresh:<uid>，成员是 `<access> <refresh>`
    RefreshPairs,
}

/// 清理任务
///
/// 每批最多处理 `batch_size` 个索引，批次之间让出调度，不阻塞前台的签发/验证请求。
/// 可重复启动：`stop()` 之后可以再次 `start()`。
pub struct CleanupWorker {
    store: Arc<SessionStore>,
    config: CleanupConfig,
    is_running: AtomicBool,
    shutdown: Notify,
    last_report: RwLock<Option<CleanupReport>>,
}

impl CleanupWorker {
    pub fn new(store: Arc<SessionStore>, config: CleanupConfig) -> Self {
        Self {
            store,
            config,
            is_running: AtomicBool::new(false),
            shutdown: Notify::new(),
            last_report: RwLock::new(None),
        }
    }

    /// 执行一次完整的清理扫描
    ///
    /// 先清理用户令牌索引中会话已不存在的成员，再清理刷新索引中关联已不存在的成员。
    pub async fn run_once(&self) -> Result<CleanupReport> {
        let started = Instant::now();
        let mut report = CleanupReport::default();

        self.sweep(IndexKind::Sessions, &mut report).await?;
        self.sweep(IndexKind::RefreshPairs, &mut report).await?;

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.finished_at = Some(Utc::now());

        metrics::record_cleanup_removed(report.removed);
        if report.removed > 0 || report.refresh_pairs_removed > 0 {
            info!(
                "🧹 清理完成: indexes={}, tokens={}, removed={}, refresh_pairs_removed={}, {}ms",
                report.indexes_scanned,
                report.tokens_scanned,
                report.removed,
                report.refresh_pairs_removed,
                report.duration_ms
            );
        } else {
            debug!(
                "清理完成，无悬挂成员: indexes={}, tokens={}, refresh_pairs={}",
                report.indexes_scanned, report.tokens_scanned, report.refresh_pairs_scanned
            );
        }

        *self.last_report.write() = Some(report.clone());
        Ok(report)
    }

    /// 按批扫描一类索引
    ///
    /// SCAN 可能重复返回同一个 key，本轮已处理过的 key 直接跳过，计数不会重复。
    async fn sweep(&self, kind: IndexKind, report: &mut CleanupReport) -> Result<()> {
        let batch_size = self.config.batch_size.max(1);
        let pattern = match kind {
            IndexKind::Sessions => self.store.index_pattern(),
            IndexKind::RefreshPairs => self.store.refresh_index_pattern(),
        };
        let mut seen = HashSet::new();
        let mut cursor = 0u64;

        loop {
            let (next, index_keys) = self.store.scan_indexes(&pattern, cursor, batch_size).await?;

            for index_key in index_keys {
                if !seen.insert(index_key.clone()) {
                    continue;
                }
                if kind == IndexKind::Sessions {
                    report.indexes_scanned += 1;
                }

                for member in self.store.index_members(&index_key).await? {
                    let live = match kind {
                        IndexKind::Sessions => {
                            report.tokens_scanned += 1;
                            self.store.exists(&member).await?
                        }
                        IndexKind::RefreshPairs => {
                            report.refresh_pairs_scanned += 1;
                            match split_pair(&member) {
                                Some((_, refresh)) => self.store.refresh_link_exists(refresh).await?,
                                None => false,
                            }
                        }
                    };
                    if live || !self.store.prune_index_member(&index_key, &member).await? {
                        continue;
                    }

                    debug!(
                        "🧹 移除悬挂索引成员: index={}, member={}",
                        index_key,
                        mask_token(&member)
                    );
                    match kind {
                        IndexKind::Sessions => report.removed += 1,
                        IndexKind::RefreshPairs => report.refresh_pairs_removed += 1,
                    }
                }
            }

            if next == 0 {
                return Ok(());
            }
            cursor = next;
            tokio::task::yield_now().await;
        }
    }

    /// 启动周期清理任务
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("清理任务已在运行，忽略重复启动");
            return None;
        }

        let period = self.config.interval().max(Duration::from_secs(1));
        info!("🚀 令牌索引清理任务已启动 (interval={}s, batch_size={})", period.as_secs(), self.config.batch_size);

        let worker = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次 tick 立即返回，跳过
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = worker.run_once().await {
                            error!("令牌索引清理失败: {}", e);
                        }
                    }
                    _ = worker.shutdown.notified() => break,
                }
            }

            worker.is_running.store(false, Ordering::SeqCst);
            info!("令牌索引清理任务已停止");
        }))
    }

    /// 停止周期清理任务
    pub fn stop(&self) {
        if self.is_running() {
            info!("正在停止令牌索引清理任务...");
            self.shutdown.notify_one();
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 最近一次清理的报告
    pub fn last_report(&self) -> Option<CleanupReport> {
        self.last_report.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::Identity;
    use crate::infra::fault_backend::FaultBackend;
    use crate::infra::kv::KvBackend;
    use crate::infra::memory_store::MemoryBackend;

    fn setup(batch_size: usize) -> (Arc<SessionStore>, Arc<CleanupWorker>) {
        setup_with(Arc::new(MemoryBackend::new()), batch_size)
    }

    fn setup_with(
        backend: Arc<dyn KvBackend>,
        batch_size: usize,
    ) -> (Arc<SessionStore>, Arc<CleanupWorker>) {
        let store = Arc::new(SessionStore::new(backend, "test:", Duration::from_secs(3600)));
        let config = CleanupConfig {
            enabled: true,
            interval_secs: 1,
            batch_size,
        };
        let worker = Arc::new(CleanupWorker::new(store.clone(), config));
        (store, worker)
    }

    #[tokio::test]
    async fn test_run_once_removes_dangling_members() {
        let (store, worker) = setup(2);

        for user_id in 1..=5u64 {
            let identity = Identity::new(user_id, format!("user-{}", user_id));
            store
                .put(&format!("live-{}", user_id), &identity, None, Duration::from_secs(60))
                .await
                .unwrap();
            store
                .put(&format!("dead-{}", user_id), &identity, None, Duration::from_secs(60))
                .await
                .unwrap();
            store
                .extend(&format!("dead-{}", user_id), Duration::ZERO)
                .await
                .unwrap();
        }

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.indexes_scanned, 5);
        assert_eq!(report.tokens_scanned, 10);
        assert_eq!(report.removed, 5);

        for user_id in 1..=5u64 {
            assert_eq!(
                store.user_tokens(user_id).await.unwrap(),
                vec![format!("live-{}", user_id)]
            );
        }

        let again = worker.run_once().await.unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(worker.last_report().unwrap().removed, 0);
    }

    #[tokio::test]
    async fn test_repeated_scan_keys_counted_once() {
        let (store, worker) = setup_with(Arc::new(FaultBackend::new().duplicating_scan()), 2);

        for user_id in 1..=3u64 {
            let identity = Identity::new(user_id, format!("user-{}", user_id));
            store
                .put(&format!("dead-{}", user_id), &identity, None, Duration::from_secs(60))
                .await
                .unwrap();
            store
                .extend(&format!("dead-{}", user_id), Duration::ZERO)
                .await
                .unwrap();
        }

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.indexes_scanned, 3);
        assert_eq!(report.tokens_scanned, 3);
        assert_eq!(report.removed, 3);
    }

    #[tokio::test]
    async fn test_run_once_prunes_stale_refresh_pairs() {
        let (store, worker) = setup(10);
        let identity = Identity::new(4, "dora");
        for (access, refresh) in [("acc-1", "ref-1"), ("acc-2", "ref-2")] {
            store
                .put(access, &identity, Some(refresh), Duration::from_secs(60))
                .await
                .unwrap();
            store
                .put_refresh_link(refresh, access, 4, Duration::from_secs(600))
                .await
                .unwrap();
        }
        // 刷新令牌已被取走（轮换中途或被动过期），索引成员悬挂
        store.take_refresh_link("ref-1").await.unwrap();

        let report = worker.run_once().await.unwrap();
        assert_eq!(report.refresh_pairs_scanned, 2);
        assert_eq!(report.refresh_pairs_removed, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(
            store.refresh_pairs(4).await.unwrap(),
            vec!["acc-2 ref-2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_start_stop_restart() {
        let (store, worker) = setup(10);
        let identity = Identity::new(1, "alice");
        store
            .put("gone", &identity, None, Duration::from_secs(60))
            .await
            .unwrap();
        store.extend("gone", Duration::ZERO).await.unwrap();

        let handle = worker.clone().start().unwrap();
        assert!(worker.is_running());
        assert!(worker.clone().start().is_none());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(worker.last_report().map(|r| r.removed), Some(1));

        worker.stop();
        handle.await.unwrap();
        assert!(!worker.is_running());

        // 可以再次启动
        let handle = worker.clone().start().unwrap();
        worker.stop();
        handle.await.unwrap();
    }
}

//! Background upkeep: sweeping expired bans and stale fingerprints from the durable
//! log, and dropping expired entries from the TTL cache.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::ban_store::SweepReport;
use crate::config::MaintenanceConfig;
use crate::context::TrapContext;
use crate::error::TrapResult;

/// Run one durable-log sweep off the async runtime
pub async fn sweep_once(ctx: Arc<TrapContext>) -> TrapResult<SweepReport> {
    tokio::task::spawn_blocking(move || ctx.bans.sweep_expired()).await?
}

/// Run one cache GC pass
pub async fn purge_cache_once(ctx: &TrapContext) -> TrapResult<usize> {
    let removed = ctx.cache().purge_expired().await?;
    debug!("Cache GC removed {} expired entries", removed);
    Ok(removed)
}

/// Spawn the sweep and cache GC loops. Both run once immediately, then on their interval.
pub fn spawn_maintenance(ctx: Arc<TrapContext>, config: &MaintenanceConfig) -> Vec<JoinHandle<()>> {
    let sweep_every = Duration::from_secs(config.sweep_interval_secs.max(1));
    let gc_every = Duration::from_secs(config.cache_gc_interval_secs.max(1));

    info!(
        "Starting maintenance: sweep every {}s, cache GC every {}s",
        sweep_every.as_secs(),
        gc_every.as_secs()
    );

    let sweep_ctx = ctx.clone();
    let sweeper = tokio::spawn(async move {
        let mut ticker = interval(sweep_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = sweep_once(sweep_ctx.clone()).await {
                error!("Ban log sweep failed: {}", e);
            }
        }
    });

    let collector = tokio::spawn(async move {
        let mut ticker = interval(gc_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = purge_cache_once(&ctx).await {
                error!("Cache GC failed: {}", e);
            }
        }
    });

    vec![sweeper, collector]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_log::{unix_now, DurableLog, SqliteLog};
    use crate::cache::{MemoryCache, TtlCache};
    use crate::config::DetectionConfig;

    fn context() -> (Arc<TrapContext>, Arc<MemoryCache>, Arc<SqliteLog>) {
        let cache = Arc::new(MemoryCache::new());
        let log = Arc::new(SqliteLog::open_in_memory().unwrap());
        let ctx = TrapContext::new(DetectionConfig::default(), cache.clone(), log.clone(), Vec::new());
        (Arc::new(ctx), cache, log)
    }

    #[tokio::test]
    async fn test_sweep_once_removes_expired() {
        let (ctx, _cache, log) = context();
        let now = unix_now();
        log.insert_ban("192.0.2.1", "old", now - 100, now - 10).unwrap();

        let report = sweep_once(ctx.clone()).await.unwrap();
        assert_eq!(report.expired_bans, 1);
        assert_eq!(sweep_once(ctx).await.unwrap().expired_bans, 0);
    }

    #[tokio::test]
    async fn test_purge_cache_once() {
        let (ctx, cache, _log) = context();
        cache.set("stale", b"1", Duration::from_millis(1)).await.unwrap();
        cache.set("fresh", b"1", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(purge_cache_once(&ctx).await.unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_loops_run_immediately() {
        let (ctx, _cache, log) = context();
        let now = unix_now();
        log.insert_ban("192.0.2.1", "old", now - 100, now - 10).unwrap();

        // Still visible when queried as of a time before it expired
        let still_stored = || log.active_ban("192.0.2.1", now - 50).unwrap().is_some();
        assert!(still_stored());

        let handles = spawn_maintenance(ctx, &MaintenanceConfig::default());
        for _ in 0..100 {
            if !still_stored() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for handle in handles {
            handle.abort();
        }
        assert!(!still_stored());
    }
}

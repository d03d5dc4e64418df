use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ban_log::{unix_now, BanRecord, BanStats, DurableLog};
use crate::cache::{cache_key, TtlCache};
use crate::challenge::ChallengeEngine;
use crate::config::{BlockMode, DetectionConfig};
use crate::error::TrapResult;

/// Fingerprints older than this are swept
const FINGERPRINT_RETENTION_SECS: i64 = 86_400;

/// Number of reasons reported in stats
const TOP_REASONS: u32 = 5;

/// What `ban` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// A new record was written
    Banned,
    /// The IP already had an active ban; nothing changed
    AlreadyBanned,
    /// Test mode: the ban was logged only
    Logged,
}

/// Result of a maintenance sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_bans: usize,
    pub stale_fingerprints: usize,
}

/// Banned IPs: the durable log is authoritative, the cache flag is a fast path.
pub struct BanStore {
    cache: Arc<dyn TtlCache>,
    log: Arc<dyn DurableLog>,
    challenges: ChallengeEngine,
    ban_duration: Duration,
    test_mode: bool,
    block_mode: BlockMode,
}

impl BanStore {
    pub fn new(cache: Arc<dyn TtlCache>, log: Arc<dyn DurableLog>, config: &DetectionConfig) -> Self {
        Self {
            challenges: ChallengeEngine::new(cache.clone()),
            cache,
            log,
            ban_duration: Duration::from_secs(config.ban_secs()),
            test_mode: config.test_mode,
            block_mode: config.block_mode,
        }
    }

    pub fn challenges(&self) -> &ChallengeEngine {
        &self.challenges
    }

    pub fn log(&self) -> &Arc<dyn DurableLog> {
        &self.log
    }

    pub fn ban_duration(&self) -> Duration {
        self.ban_duration
    }

    /// Cache flag first, then the durable log. A durable hit does not refill the cache.
    pub async fn is_banned(&self, ip: &str) -> TrapResult<bool> {
        if self.cache.exists(&cache_key("ban", ip)).await? {
            return Ok(true);
        }
        Ok(self.log.active_ban(ip, unix_now())?.is_some())
    }

    /// Ban the IP unless it is already banned. Never extends an existing ban.
    pub async fn ban(&self, ip: &str, reason: &str) -> TrapResult<BanOutcome> {
        if self.is_banned(ip).await? {
            debug!("{} already banned, ignoring new reason: {}", ip, reason);
            return Ok(BanOutcome::AlreadyBanned);
        }

        if self.test_mode {
            info!("[TEST MODE] Would ban {} for: {}", ip, reason);
            return Ok(BanOutcome::Logged);
        }

        let now = unix_now();
        let expires_at = now + self.ban_duration.as_secs() as i64;
        self.log.insert_ban(ip, reason, now, expires_at)?;
        self.cache
            .set(&cache_key("ban", ip), b"1", self.ban_duration)
            .await?;

        info!(
            "Banned {} for {}h: {}",
            ip,
            self.ban_duration.as_secs() / 3_600,
            reason
        );

        if self.block_mode == BlockMode::Challenge {
            self.challenges.get_or_create(ip).await?;
        }

        Ok(BanOutcome::Banned)
    }

    /// Remove every durable record for the IP and its cache flag
    pub async fn unban(&self, ip: &str) -> TrapResult<()> {
        let removed = self.log.delete_for_ip(ip)?;
        self.cache.delete(&cache_key("ban", ip)).await?;
        info!("Unbanned {} ({} records removed)", ip, removed);
        Ok(())
    }

    /// Delete expired bans and fingerprints older than a day. Idempotent.
    pub fn sweep_expired(&self) -> TrapResult<SweepReport> {
        let now = unix_now();
        let report = SweepReport {
            expired_bans: self.log.delete_expired(now)?,
            stale_fingerprints: self
                .log
                .purge_fingerprints_before(now - FINGERPRINT_RETENTION_SECS)?,
        };

        info!(
            "Sweep removed {} expired bans and {} stale fingerprints",
            report.expired_bans, report.stale_fingerprints
        );
        Ok(report)
    }

    /// Let the next request from this IP through unconditionally, and skip the geo
    /// gate for the rest of the ban period.
    pub async fn grant_grace(&self, ip: &str) -> TrapResult<()> {
        self.cache
            .set(&cache_key("grace", ip), b"1", self.ban_duration)
            .await?;
        self.cache
            .set(&cache_key("geo_passed", ip), b"1", self.ban_duration)
            .await
    }

    /// Consume the one-shot grace flag. Returns whether it was present.
    pub async fn take_grace(&self, ip: &str) -> TrapResult<bool> {
        let key = cache_key("grace", ip);
        if self.cache.exists(&key).await? {
            self.cache.delete(&key).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn has_geo_pass(&self, ip: &str) -> TrapResult<bool> {
        self.cache.exists(&cache_key("geo_passed", ip)).await
    }

    pub fn list_active(&self, limit: u32, offset: u32) -> TrapResult<Vec<BanRecord>> {
        self.log.list_active(unix_now(), limit, offset)
    }

    pub fn count_active(&self) -> TrapResult<u64> {
        self.log.count_active(unix_now())
    }

    pub fn stats(&self) -> TrapResult<BanStats> {
        self.log.stats(unix_now(), TOP_REASONS)
    }

    /// Lift every active ban. Returns how many IPs were released.
    pub async fn unblock_all(&self) -> TrapResult<usize> {
        let ips = self.log.delete_active(unix_now())?;
        self.clear_flags(&ips).await;
        info!("Unblocked all {} banned IPs", ips.len());
        Ok(ips.len())
    }

    /// Truncate the ban and fingerprint tables
    pub async fn clear_logs(&self) -> TrapResult<usize> {
        let ips = self.log.clear_all(unix_now())?;
        self.clear_flags(&ips).await;
        info!("Cleared ban log ({} active IPs released)", ips.len());
        Ok(ips.len())
    }

    async fn clear_flags(&self, ips: &[String]) {
        for ip in ips {
            if let Err(e) = self.cache.delete(&cache_key("ban", ip)).await {
                warn!("Failed to clear ban flag for {}: {}", ip, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_log::SqliteLog;
    use crate::cache::MemoryCache;

    fn store_with(config: DetectionConfig) -> (BanStore, Arc<MemoryCache>, Arc<SqliteLog>) {
        let cache = Arc::new(MemoryCache::new());
        let log = Arc::new(SqliteLog::open_in_memory().unwrap());
        let store = BanStore::new(cache.clone(), log.clone(), &config);
        (store, cache, log)
    }

    fn store() -> (BanStore, Arc<MemoryCache>, Arc<SqliteLog>) {
        store_with(DetectionConfig::default())
    }

    #[tokio::test]
    async fn test_ban_is_idempotent() {
        let (store, _cache, log) = store();

        assert_eq!(store.ban("192.0.2.1", "first").await.unwrap(), BanOutcome::Banned);
        let first = log.active_ban("192.0.2.1", unix_now()).unwrap().unwrap();

        assert_eq!(
            store.ban("192.0.2.1", "second").await.unwrap(),
            BanOutcome::AlreadyBanned
        );
        assert_eq!(log.count_active(unix_now()).unwrap(), 1);
        let again = log.active_ban("192.0.2.1", unix_now()).unwrap().unwrap();
        assert_eq!(again.expires_at, first.expires_at);
        assert_eq!(again.reason, "first");
    }

    #[tokio::test]
    async fn test_ban_sets_duration() {
        let (store, _cache, log) = store();
        store.ban("192.0.2.1", "test").await.unwrap();

        let record = log.active_ban("192.0.2.1", unix_now()).unwrap().unwrap();
        assert_eq!(record.expires_at - record.banned_at, 6 * 3_600);
    }

    #[tokio::test]
    async fn test_durable_hit_does_not_refill_cache() {
        let (store, cache, log) = store();
        let now = unix_now();
        log.insert_ban("192.0.2.1", "restored", now, now + 60).unwrap();

        assert!(store.is_banned("192.0.2.1").await.unwrap());
        assert!(!cache.exists(&cache_key("ban", "192.0.2.1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unban_clears_both_tiers() {
        let (store, cache, _log) = store();
        store.ban("192.0.2.1", "test").await.unwrap();
        assert!(store.is_banned("192.0.2.1").await.unwrap());

        store.unban("192.0.2.1").await.unwrap();
        assert!(!store.is_banned("192.0.2.1").await.unwrap());
        assert!(!cache.exists(&cache_key("ban", "192.0.2.1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_test_mode_only_logs() {
        let (store, _cache, log) = store_with(DetectionConfig {
            test_mode: true,
            ..Default::default()
        });

        assert_eq!(store.ban("192.0.2.1", "test").await.unwrap(), BanOutcome::Logged);
        assert!(!store.is_banned("192.0.2.1").await.unwrap());
        assert_eq!(log.count_active(unix_now()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_challenge_mode_creates_challenge_on_ban() {
        let (store, _cache, _log) = store_with(DetectionConfig {
            block_mode: BlockMode::Challenge,
            ..Default::default()
        });

        store.ban("192.0.2.1", "test").await.unwrap();
        assert!(store.challenges().active("192.0.2.1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_static_mode_creates_no_challenge() {
        let (store, _cache, _log) = store();
        store.ban("192.0.2.1", "test").await.unwrap();
        assert!(store.challenges().active("192.0.2.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_grace_is_consumed_once() {
        let (store, _cache, _log) = store();
        store.grant_grace("192.0.2.1").await.unwrap();

        assert!(store.take_grace("192.0.2.1").await.unwrap());
        assert!(!store.take_grace("192.0.2.1").await.unwrap());
        // The geo pass outlives the grace flag
        assert!(store.has_geo_pass("192.0.2.1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let (store, _cache, log) = store();
        let now = unix_now();
        log.insert_ban("192.0.2.1", "old", now - 7_200, now - 3_600).unwrap();
        log.insert_ban("192.0.2.2", "live", now, now + 3_600).unwrap();
        log.upsert_fingerprint("192.0.2.1", "abc", "curl", now - 2 * 86_400)
            .unwrap();

        let report = store.sweep_expired().unwrap();
        assert_eq!(report.expired_bans, 1);
        assert_eq!(report.stale_fingerprints, 1);

        assert_eq!(store.sweep_expired().unwrap(), SweepReport::default());
        assert_eq!(store.count_active().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unblock_all_clears_flags() {
        let (store, cache, _log) = store();
        store.ban("192.0.2.1", "a").await.unwrap();
        store.ban("192.0.2.2", "b").await.unwrap();

        assert_eq!(store.unblock_all().await.unwrap(), 2);
        assert!(!store.is_banned("192.0.2.1").await.unwrap());
        assert!(!cache.exists(&cache_key("ban", "192.0.2.2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_logs() {
        let (store, _cache, _log) = store();
        store.ban("192.0.2.1", "a").await.unwrap();

        assert_eq!(store.clear_logs().await.unwrap(), 1);
        assert!(!store.is_banned("192.0.2.1").await.unwrap());
        assert_eq!(store.stats().unwrap().active_bans, 0);
    }
}

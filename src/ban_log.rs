use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::TrapResult;
use crate::lock_utils::lock_or_fail;

/// Current Unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Durable ban record. Timestamps are Unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BanRecord {
    pub id: i64,
    pub ip: String,
    pub reason: String,
    pub banned_at: i64,
    pub expires_at: i64,
}

impl BanRecord {
    pub fn is_active(&self, now: i64) -> bool {
        self.expires_at > now
    }

    /// Seconds until expiry, 0 once expired
    pub fn remaining_secs(&self, now: i64) -> u64 {
        (self.expires_at - now).max(0) as u64
    }
}

/// Per-IP request-shape counter kept for forensics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FingerprintRecord {
    pub ip: String,
    pub fingerprint: String,
    pub user_agent: String,
    pub request_count: u64,
    pub last_seen: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReasonCount {
    pub reason: String,
    pub count: u64,
}

/// Aggregate ban statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BanStats {
    pub active_bans: u64,
    pub unique_ips: u64,
    pub bans_last_24h: u64,
    pub top_reasons: Vec<ReasonCount>,
}

/// Queryable durable log. Authoritative for bans; the TTL cache only mirrors it.
///
/// Every query that depends on "now" takes it explicitly so callers decide the clock.
pub trait DurableLog: Send + Sync {
    /// Insert a ban row and return its id
    fn insert_ban(&self, ip: &str, reason: &str, banned_at: i64, expires_at: i64)
        -> TrapResult<i64>;

    /// Newest non-expired record for the IP
    fn active_ban(&self, ip: &str, now: i64) -> TrapResult<Option<BanRecord>>;

    /// Delete every record for the IP, expired or not. Returns rows removed.
    fn delete_for_ip(&self, ip: &str) -> TrapResult<usize>;

    /// Non-expired records, newest first
    fn list_active(&self, now: i64, limit: u32, offset: u32) -> TrapResult<Vec<BanRecord>>;

    fn count_active(&self, now: i64) -> TrapResult<u64>;

    /// Delete records with `expires_at <= now`
    fn delete_expired(&self, now: i64) -> TrapResult<usize>;

    /// Delete all non-expired records and return the distinct IPs they covered
    fn delete_active(&self, now: i64) -> TrapResult<Vec<String>>;

    /// Truncate the ban table. Returns the distinct IPs that were still active.
    fn clear_all(&self, now: i64) -> TrapResult<Vec<String>>;

    fn stats(&self, now: i64, top_reasons: u32) -> TrapResult<BanStats>;

    /// Insert or bump the (ip, fingerprint) row
    fn upsert_fingerprint(
        &self,
        ip: &str,
        fingerprint: &str,
        user_agent: &str,
        now: i64,
    ) -> TrapResult<()>;

    fn fingerprints_for(&self, ip: &str) -> TrapResult<Vec<FingerprintRecord>>;

    /// Delete fingerprints last seen before `cutoff`
    fn purge_fingerprints_before(&self, cutoff: i64) -> TrapResult<usize>;

    /// Cheap liveness probe
    fn ping(&self) -> TrapResult<()>;
}

/// SQLite-backed durable log
pub struct SqliteLog {
    conn: Mutex<Connection>,
}

impl SqliteLog {
    /// Create or open the log database at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> TrapResult<Self> {
        let conn = Connection::open(db_path.as_ref())?;
        let log = Self::with_connection(conn)?;
        info!("Opened ban log database: {:?}", db_path.as_ref());
        Ok(log)
    }

    /// Private in-memory database, used by tests and `storage.sqlite_path = ":memory:"`
    pub fn open_in_memory() -> TrapResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> TrapResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ip TEXT NOT NULL,
                reason TEXT NOT NULL,
                banned_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_bans_ip ON bans(ip);
            CREATE INDEX IF NOT EXISTS idx_bans_expires_at ON bans(expires_at);

            CREATE TABLE IF NOT EXISTS fingerprints (
                ip TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                request_count INTEGER NOT NULL DEFAULT 1,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (ip, fingerprint)
            );
            CREATE INDEX IF NOT EXISTS idx_fingerprints_last_seen ON fingerprints(last_seen);",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn ban_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BanRecord> {
    Ok(BanRecord {
        id: row.get(0)?,
        ip: row.get(1)?,
        reason: row.get(2)?,
        banned_at: row.get(3)?,
        expires_at: row.get(4)?,
    })
}

fn distinct_ips(conn: &Connection, sql: &str, now: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let ips = stmt
        .query_map(params![now], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ips)
}

impl DurableLog for SqliteLog {
    fn insert_ban(
        &self,
        ip: &str,
        reason: &str,
        banned_at: i64,
        expires_at: i64,
    ) -> TrapResult<i64> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        conn.execute(
            "INSERT INTO bans (ip, reason, banned_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
            params![ip, reason, banned_at, expires_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn active_ban(&self, ip: &str, now: i64) -> TrapResult<Option<BanRecord>> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let record = conn
            .query_row(
                "SELECT id, ip, reason, banned_at, expires_at
                 FROM bans
                 WHERE ip = ?1 AND expires_at > ?2
                 ORDER BY banned_at DESC, id DESC
                 LIMIT 1",
                params![ip, now],
                ban_from_row,
            )
            .optional()?;
        Ok(record)
    }

    fn delete_for_ip(&self, ip: &str) -> TrapResult<usize> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let rows = conn.execute("DELETE FROM bans WHERE ip = ?1", params![ip])?;
        Ok(rows)
    }

    fn list_active(&self, now: i64, limit: u32, offset: u32) -> TrapResult<Vec<BanRecord>> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let mut stmt = conn.prepare(
            "SELECT id, ip, reason, banned_at, expires_at
             FROM bans
             WHERE expires_at > ?1
             ORDER BY banned_at DESC, id DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let records = stmt
            .query_map(params![now, limit, offset], ban_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn count_active(&self, now: i64) -> TrapResult<u64> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bans WHERE expires_at > ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn delete_expired(&self, now: i64) -> TrapResult<usize> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let deleted = conn.execute("DELETE FROM bans WHERE expires_at <= ?1", params![now])?;
        if deleted > 0 {
            debug!("Deleted {} expired ban records", deleted);
        }
        Ok(deleted)
    }

    fn delete_active(&self, now: i64) -> TrapResult<Vec<String>> {
        let mut conn = lock_or_fail(&self.conn, "ban log")?;
        let tx = conn.transaction()?;
        let ips = distinct_ips(
            &tx,
            "SELECT DISTINCT ip FROM bans WHERE expires_at > ?1",
            now,
        )?;
        tx.execute("DELETE FROM bans WHERE expires_at > ?1", params![now])?;
        tx.commit()?;
        Ok(ips)
    }

    fn clear_all(&self, now: i64) -> TrapResult<Vec<String>> {
        let mut conn = lock_or_fail(&self.conn, "ban log")?;
        let tx = conn.transaction()?;
        let ips = distinct_ips(
            &tx,
            "SELECT DISTINCT ip FROM bans WHERE expires_at > ?1",
            now,
        )?;
        tx.execute("DELETE FROM bans", [])?;
        tx.execute("DELETE FROM fingerprints", [])?;
        tx.commit()?;
        Ok(ips)
    }

    fn stats(&self, now: i64, top_reasons: u32) -> TrapResult<BanStats> {
        let conn = lock_or_fail(&self.conn, "ban log")?;

        let (active, unique): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT ip) FROM bans WHERE expires_at > ?1",
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bans WHERE banned_at > ?1",
            params![now - 86_400],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT reason, COUNT(*) AS hits
             FROM bans
             GROUP BY reason
             ORDER BY hits DESC, reason ASC
             LIMIT ?1",
        )?;
        let reasons = stmt
            .query_map(params![top_reasons], |row| {
                Ok(ReasonCount {
                    reason: row.get(0)?,
                    count: row.get::<_, i64>(1)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(BanStats {
            active_bans: active as u64,
            unique_ips: unique as u64,
            bans_last_24h: last_24h as u64,
            top_reasons: reasons,
        })
    }

    fn upsert_fingerprint(
        &self,
        ip: &str,
        fingerprint: &str,
        user_agent: &str,
        now: i64,
    ) -> TrapResult<()> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        conn.execute(
            "INSERT INTO fingerprints (ip, fingerprint, user_agent, request_count, last_seen)
             VALUES (?1, ?2, ?3, 1, ?4)
             ON CONFLICT(ip, fingerprint) DO UPDATE SET
                request_count = request_count + 1,
                last_seen = excluded.last_seen",
            params![ip, fingerprint, user_agent, now],
        )?;
        Ok(())
    }

    fn fingerprints_for(&self, ip: &str) -> TrapResult<Vec<FingerprintRecord>> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let mut stmt = conn.prepare(
            "SELECT ip, fingerprint, user_agent, request_count, last_seen
             FROM fingerprints
             WHERE ip = ?1
             ORDER BY last_seen DESC",
        )?;

        let records = stmt
            .query_map(params![ip], |row| {
                Ok(FingerprintRecord {
                    ip: row.get(0)?,
                    fingerprint: row.get(1)?,
                    user_agent: row.get(2)?,
                    request_count: row.get::<_, i64>(3)? as u64,
                    last_seen: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn purge_fingerprints_before(&self, cutoff: i64) -> TrapResult<usize> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        let deleted = conn.execute(
            "DELETE FROM fingerprints WHERE last_seen < ?1",
            params![cutoff],
        )?;
        Ok(deleted)
    }

    fn ping(&self) -> TrapResult<()> {
        let conn = lock_or_fail(&self.conn, "ban log")?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }
}

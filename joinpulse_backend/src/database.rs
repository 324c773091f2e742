use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::cycle::CycleId;

/// Age and row caps applied to `bot_tracked_messages`.
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub cutoff: DateTime<Utc>,
    pub max_rows: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackOutcome {
    pub inserted: bool,
    pub pruned: usize,
}

/// Fixed set of SQLite connections shared by every loop. A caller holds one
/// slot for a single statement or transaction and never across an await.
struct ConnectionPool {
    slots: Vec<Mutex<Connection>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    fn open(path: &Path, size: usize) -> Result<Self> {
        let mut slots = Vec::with_capacity(size.max(1));
        for _ in 0..size.max(1) {
            let conn = Connection::open(path)
                .with_context(|| format!("Failed to open database {:?}", path))?;
            conn.busy_timeout(Duration::from_secs(5))?;
            let _mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            slots.push(Mutex::new(conn));
        }
        Ok(Self {
            slots,
            next: AtomicUsize::new(0),
        })
    }

    fn acquire(&self) -> Result<MutexGuard<'_, Connection>> {
        let start = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        for offset in 0..self.slots.len() {
            let slot = &self.slots[(start + offset) % self.slots.len()];
            if let Ok(guard) = slot.try_lock() {
                return Ok(guard);
            }
        }
        self.slots[start]
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    fn size(&self) -> usize {
        self.slots.len()
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed-width UTC form so string order matches time order.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub struct BotDatabase {
    pool: ConnectionPool,
}

impl BotDatabase {
    /// Open (or create) the database with `pool_size` connections.
    pub fn new<P: AsRef<Path>>(path: P, pool_size: usize) -> Result<Self> {
        let pool = ConnectionPool::open(path.as_ref(), pool_size)?;
        let db = Self { pool };
        db.ensure_schema()?;
        tracing::info!(
            "Database ready at {:?} (pool size {})",
            path.as_ref(),
            db.pool.size()
        );
        Ok(db)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.pool.acquire()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS joined_names (
                name TEXT PRIMARY KEY,
                first_seen TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS used_names (
                cycle_id TEXT NOT NULL,
                name TEXT NOT NULL,
                PRIMARY KEY (cycle_id, name)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS bot_tracked_messages (
                message_id INTEGER PRIMARY KEY,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS bot_state (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_joined_names_first_seen ON joined_names(first_seen)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bot_tracked_messages_created_at ON bot_tracked_messages(created_at DESC)",
            [],
        )?;

        Ok(())
    }

    // ─── joined_names ────────────────────────────────────────────────────────

    /// Insert-or-ignore. Returns whether the name was new.
    pub fn insert_joined_name(&self, name: &str, first_seen: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO joined_names (name, first_seen) VALUES (?1, ?2)",
            params![name, timestamp(first_seen)],
        )?;
        Ok(changed > 0)
    }

    /// Every known name, oldest first.
    pub fn load_joined_names(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT name FROM joined_names ORDER BY first_seen ASC, rowid ASC")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ─── used_names ──────────────────────────────────────────────────────────

    pub fn is_name_used(&self, cycle: CycleId, name: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let found = conn
            .query_row(
                "SELECT 1 FROM used_names WHERE cycle_id = ?1 AND name = ?2",
                params![cycle.as_db_string(), name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Insert-or-ignore on `(cycle_id, name)`. Returns whether this call
    /// created the row.
    pub fn mark_name_used(&self, cycle: CycleId, name: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO used_names (cycle_id, name) VALUES (?1, ?2)",
            params![cycle.as_db_string(), name],
        )?;
        Ok(changed > 0)
    }

    pub fn used_names_for_cycle(&self, cycle: CycleId) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT name FROM used_names WHERE cycle_id = ?1 ORDER BY name ASC")?;
        let names = stmt
            .query_map([cycle.as_db_string()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // ─── bot_state ───────────────────────────────────────────────────────────

    pub fn get_state(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM bot_state WHERE key = ?1",
                [key],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_state(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO bot_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ─── bot_tracked_messages ────────────────────────────────────────────────

    /// Record a bot message and, when `prune` is given, apply retention in the
    /// same transaction.
    pub fn track_message(
        &self,
        message_id: i64,
        created_at: DateTime<Utc>,
        prune: Option<RetentionPolicy>,
    ) -> Result<TrackOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO bot_tracked_messages (message_id, created_at) VALUES (?1, ?2)",
            params![message_id, timestamp(created_at)],
        )? > 0;

        let mut pruned = 0;
        if let Some(policy) = prune {
            pruned += tx.execute(
                "DELETE FROM bot_tracked_messages WHERE created_at < ?1",
                [timestamp(policy.cutoff)],
            )?;
            pruned += tx.execute(
                "DELETE FROM bot_tracked_messages WHERE message_id NOT IN (
                    SELECT message_id FROM bot_tracked_messages
                    ORDER BY created_at DESC, message_id DESC
                    LIMIT ?1
                )",
                [policy.max_rows as i64],
            )?;
        }

        tx.commit()?;
        Ok(TrackOutcome { inserted, pruned })
    }

    pub fn tracked_message_ids(&self) -> Result<Vec<i64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT message_id FROM bot_tracked_messages ORDER BY created_at ASC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    /// Drop the given ids in one transaction. Returns rows removed.
    pub fn forget_tracked_messages(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM bot_tracked_messages WHERE message_id = ?1")?;
            for id in ids {
                removed += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn count_tracked_messages(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM bot_tracked_messages", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    pub fn oldest_tracked_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MIN(created_at) FROM bot_tracked_messages",
            [],
            |row| row.get(0),
        )?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .with_context(|| format!("Bad created_at in bot_tracked_messages: {}", s))
        })
        .transpose()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::path::PathBuf;

    pub(crate) fn temp_db_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("joinpulse_{}_{}.db", name, uuid::Uuid::new_v4()));
        path
    }

    pub(crate) fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{}", path.display(), suffix));
        }
    }

    fn cycle(d: u32) -> CycleId {
        CycleId::new(NaiveDate::from_ymd_opt(2024, 3, d).expect("date"))
    }

    #[test]
    fn joined_names_are_unique_and_ordered_by_first_seen() {
        let path = temp_db_path("joined");
        let db = BotDatabase::new(&path, 2).expect("db init");
        let t0 = Utc::now();

        assert!(db.insert_joined_name("bob", t0 + ChronoDuration::seconds(5)).unwrap());
        assert!(db.insert_joined_name("alice", t0).unwrap());
        assert!(!db.insert_joined_name("bob", t0 + ChronoDuration::seconds(9)).unwrap());

        assert_eq!(db.load_joined_names().unwrap(), vec!["alice", "bob"]);
        cleanup(&path);
    }

    #[test]
    fn used_marks_are_partitioned_by_cycle() {
        let path = temp_db_path("used");
        let db = BotDatabase::new(&path, 2).expect("db init");

        assert!(db.mark_name_used(cycle(9), "alice").unwrap());
        assert!(!db.mark_name_used(cycle(9), "alice").unwrap());
        assert!(db.is_name_used(cycle(9), "alice").unwrap());
        assert!(!db.is_name_used(cycle(10), "alice").unwrap());
        assert_eq!(db.used_names_for_cycle(cycle(9)).unwrap(), vec!["alice"]);
        cleanup(&path);
    }

    #[test]
    fn retention_drops_old_rows_then_caps_count() {
        let path = temp_db_path("retention");
        let db = BotDatabase::new(&path, 1).expect("db init");
        let now = Utc::now();

        for id in 1..=3 {
            db.track_message(id, now - ChronoDuration::hours(100), None)
                .unwrap();
        }
        for id in 10..=15 {
            db.track_message(id, now - ChronoDuration::minutes(id), None)
                .unwrap();
        }
        assert_eq!(db.count_tracked_messages().unwrap(), 9);

        let outcome = db
            .track_message(
                99,
                now,
                Some(RetentionPolicy {
                    cutoff: now - ChronoDuration::hours(72),
                    max_rows: 4,
                }),
            )
            .unwrap();

        assert!(outcome.inserted);
        assert_eq!(outcome.pruned, 3 + 3);
        let mut ids = db.tracked_message_ids().unwrap();
        ids.sort();
        // Newest four: 99 (now), 10, 11, 12 minutes ago.
        assert_eq!(ids, vec![10, 11, 12, 99]);
        cleanup(&path);
    }

    #[test]
    fn duplicate_tracking_is_ignored() {
        let path = temp_db_path("dup_track");
        let db = BotDatabase::new(&path, 1).expect("db init");
        let now = Utc::now();

        assert!(db.track_message(5, now, None).unwrap().inserted);
        assert!(!db.track_message(5, now, None).unwrap().inserted);
        assert_eq!(db.count_tracked_messages().unwrap(), 1);
        assert_eq!(db.forget_tracked_messages(&[5, 6]).unwrap(), 1);
        assert_eq!(db.oldest_tracked_at().unwrap(), None);
        cleanup(&path);
    }

    #[test]
    fn state_values_overwrite_and_survive_reopen() {
        let path = temp_db_path("state_reopen");
        {
            let db = BotDatabase::new(&path, 1).unwrap();
            assert_eq!(db.get_state("daily_post_message_id").unwrap(), None);
            db.set_state("daily_post_message_id", 10).unwrap();
            db.set_state("daily_post_message_id", 11).unwrap();
        }
        let db = BotDatabase::new(&path, 1).unwrap();
        assert_eq!(db.get_state("daily_post_message_id").unwrap(), Some(11));
        cleanup(&path);
    }
}

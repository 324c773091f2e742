//! Known participant names and per-cycle "already announced" marks.

use std::sync::{Arc, RwLock, RwLockReadGuard};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::time::sleep;

use crate::cycle::CycleClock;
use crate::database::BotDatabase;

pub const DEFAULT_WRITE_ATTEMPTS: usize = 3;
pub const DEFAULT_WRITE_BACKOFF: Duration = Duration::from_millis(200);

/// Trimmed display name, or `None` when nothing is left.
pub fn normalize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub struct NameRegistry {
    db: Arc<BotDatabase>,
    clock: CycleClock,
    names: RwLock<Vec<String>>,
    write_attempts: usize,
    write_backoff: Duration,
}

impl NameRegistry {
    pub fn new(db: Arc<BotDatabase>, clock: CycleClock) -> Self {
        Self::with_retry(db, clock, DEFAULT_WRITE_ATTEMPTS, DEFAULT_WRITE_BACKOFF)
    }

    pub fn with_retry(
        db: Arc<BotDatabase>,
        clock: CycleClock,
        write_attempts: usize,
        write_backoff: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            names: RwLock::new(Vec::new()),
            write_attempts: write_attempts.max(1),
            write_backoff,
        }
    }

    pub fn clock(&self) -> &CycleClock {
        &self.clock
    }

    /// Persist a newly observed name, then add it to memory. Memory is only
    /// touched after the durable write succeeded; after the retry budget is
    /// spent the name is dropped until the next full load.
    pub async fn remember(&self, raw: &str) -> bool {
        let Some(name) = normalize_name(raw) else {
            return false;
        };

        let stored = self
            .retry_write("remember name", || {
                self.db.insert_joined_name(&name, Utc::now())
            })
            .await;
        if stored.is_none() {
            return false;
        }

        let mut names = self.names.write().unwrap_or_else(|e| e.into_inner());
        if names.iter().any(|known| known == &name) {
            return false;
        }
        tracing::debug!("Registered participant name {:?}", name);
        names.push(name);
        true
    }

    /// Reload every known name from the store (oldest first) and replace the
    /// in-memory list with it.
    pub async fn load_all(&self) -> Result<Vec<String>> {
        let loaded = self.db.load_joined_names()?;
        *self.names.write().unwrap_or_else(|e| e.into_inner()) = loaded.clone();
        tracing::info!("Loaded {} known participant name(s)", loaded.len());
        Ok(loaded)
    }

    fn read_names(&self) -> RwLockReadGuard<'_, Vec<String>> {
        self.names.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn names(&self) -> Vec<String> {
        self.read_names().clone()
    }

    pub fn len(&self) -> usize {
        self.read_names().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_names().is_empty()
    }

    /// Uniformly random known name.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<String> {
        self.read_names().choose(rng).cloned()
    }

    /// Read errors surface to the caller.
    pub fn is_used_this_cycle(&self, name: &str) -> Result<bool> {
        let cycle = self.clock.current();
        self.db.is_name_used(cycle, name.trim())
    }

    /// Insert-or-ignore the mark for the current cycle. Returns whether this
    /// call created it; a concurrent winner or an exhausted retry budget both
    /// yield `false`.
    pub async fn mark_used_this_cycle(&self, name: &str) -> bool {
        let cycle = self.clock.current();
        let name = name.trim();
        self.retry_write("mark name used", || self.db.mark_name_used(cycle, name))
            .await
            .unwrap_or(false)
    }

    async fn retry_write<T, F>(&self, what: &str, mut op: F) -> Option<T>
    where
        F: FnMut() -> Result<T>,
    {
        for attempt in 0..self.write_attempts {
            match op() {
                Ok(value) => return Some(value),
                Err(e) if attempt + 1 < self.write_attempts => {
                    let delay = self.write_backoff * (1u32 << attempt.min(6));
                    tracing::warn!(
                        "Failed to {} (attempt {}/{}): {}; retrying in {:?}",
                        what,
                        attempt + 1,
                        self.write_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up on {} after {} attempts: {}",
                        what,
                        self.write_attempts,
                        e
                    );
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{cleanup, temp_db_path};
    use chrono::NaiveTime;

    fn registry(name: &str) -> (Arc<NameRegistry>, Arc<BotDatabase>, std::path::PathBuf) {
        let path = temp_db_path(name);
        let db = Arc::new(BotDatabase::new(&path, 3).expect("db init"));
        let clock = CycleClock::new(
            NaiveTime::from_hms_opt(5, 0, 0).expect("time"),
            chrono_tz::Europe::Amsterdam,
        );
        (
            Arc::new(NameRegistry::with_retry(
                db.clone(),
                clock,
                2,
                Duration::from_millis(1),
            )),
            db,
            path,
        )
    }

    #[test]
    fn names_are_trimmed_and_blank_rejected() {
        assert_eq!(normalize_name("  Alice "), Some("Alice".to_string()));
        assert_eq!(normalize_name("   "), None);
    }

    #[tokio::test]
    async fn remember_twice_loads_once() {
        let (registry, _db, path) = registry("registry_remember");

        assert!(registry.remember("alice").await);
        assert!(!registry.remember(" alice ").await);
        assert!(registry.remember("bob").await);
        assert!(!registry.remember("").await);

        let loaded = registry.load_all().await.unwrap();
        assert_eq!(loaded, vec!["alice", "bob"]);
        assert_eq!(registry.len(), 2);
        cleanup(&path);
    }

    #[tokio::test]
    async fn load_all_seeds_a_fresh_registry() {
        let (registry, db, path) = registry("registry_seed");
        registry.remember("carol").await;

        let fresh = NameRegistry::new(db, *registry.clock());
        assert!(fresh.is_empty());
        fresh.load_all().await.unwrap();
        assert_eq!(fresh.names(), vec!["carol"]);
        let picked = fresh.pick_random(&mut rand::thread_rng());
        assert_eq!(picked.as_deref(), Some("carol"));
        cleanup(&path);
    }

    #[tokio::test]
    async fn marking_twice_keeps_one_row() {
        let (registry, db, path) = registry("registry_mark_twice");

        assert!(!registry.is_used_this_cycle("alice").unwrap());
        assert!(registry.mark_used_this_cycle("alice").await);
        assert!(!registry.mark_used_this_cycle("alice").await);
        assert!(registry.is_used_this_cycle("alice").unwrap());

        let cycle = registry.clock().current();
        assert_eq!(db.used_names_for_cycle(cycle).unwrap(), vec!["alice"]);
        cleanup(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_marks_store_a_single_row() {
        let (registry, db, path) = registry("registry_race");

        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let was_used = registry.is_used_this_cycle("alice").unwrap();
                let inserted = registry.mark_used_this_cycle("alice").await;
                (was_used, inserted)
            }));
        }

        let mut inserted = 0;
        for handle in handles {
            let (_, won) = handle.await.unwrap();
            if won {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
        let cycle = registry.clock().current();
        assert_eq!(db.used_names_for_cycle(cycle).unwrap(), vec!["alice"]);
        cleanup(&path);
    }

    #[tokio::test]
    async fn rejected_writes_leave_memory_untouched() {
        let (registry, _db, path) = registry("registry_write_fail");
        {
            let other = rusqlite::Connection::open(&path).unwrap();
            other
                .execute_batch("DROP TABLE joined_names; DROP TABLE used_names;")
                .unwrap();
        }

        assert!(!registry.remember("ivan").await);
        assert!(registry.names().is_empty());
        assert!(!registry.mark_used_this_cycle("ivan").await);
        assert!(registry.is_used_this_cycle("ivan").is_err());
        cleanup(&path);
    }
}

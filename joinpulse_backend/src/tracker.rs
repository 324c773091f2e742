//! Bookkeeping for bot messages posted into the verify thread so they can be
//! bulk-deleted at the cycle boundary.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::database::{BotDatabase, RetentionPolicy};
use crate::transport::MessageId;

pub struct MessageTracker {
    db: Arc<BotDatabase>,
    retention: ChronoDuration,
    max_rows: u64,
    prune_every: u64,
    calls: AtomicU64,
}

impl MessageTracker {
    pub fn new(
        db: Arc<BotDatabase>,
        retention: ChronoDuration,
        max_rows: u64,
        prune_every: u64,
    ) -> Self {
        Self {
            db,
            retention,
            max_rows,
            prune_every: prune_every.max(1),
            calls: AtomicU64::new(0),
        }
    }

    pub fn track(&self, message_id: MessageId) -> Result<()> {
        self.track_at(message_id, Utc::now())
    }

    /// Record `message_id`. Every `prune_every`-th call also prunes by age and
    /// row cap inside the insert transaction; the atomic counter hands each
    /// pruning turn to exactly one caller.
    pub fn track_at(&self, message_id: MessageId, now: DateTime<Utc>) -> Result<()> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        let prune = (call % self.prune_every == 0).then(|| RetentionPolicy {
            cutoff: now - self.retention,
            max_rows: self.max_rows,
        });

        let outcome = self.db.track_message(message_id, now, prune)?;
        if prune.is_some() {
            tracing::debug!(
                "Tracked-message retention pass removed {} row(s)",
                outcome.pruned
            );
        }
        Ok(())
    }

    /// Delete every tracked message through `delete`, then keep only the ids
    /// whose deletion failed so the next sweep retries them. Returns how many
    /// ids are still tracked from this sweep.
    pub async fn sweep_and_clear<F, Fut>(&self, mut delete: F) -> Result<usize>
    where
        F: FnMut(MessageId) -> Fut,
        Fut: Future<Output = bool>,
    {
        let ids = self.db.tracked_message_ids()?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut deleted = Vec::with_capacity(ids.len());
        let mut kept = 0usize;
        for id in ids {
            if delete(id).await {
                deleted.push(id);
            } else {
                kept += 1;
            }
        }

        self.db.forget_tracked_messages(&deleted)?;
        tracing::info!(
            "Verify-thread sweep: deleted {}, kept {} for retry",
            deleted.len(),
            kept
        );
        Ok(kept)
    }

    pub fn tracked_count(&self) -> Result<usize> {
        self.db.count_tracked_messages()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::tests::{cleanup, temp_db_path};
    use std::collections::HashSet;

    fn tracker(name: &str, max_rows: u64, prune_every: u64) -> (MessageTracker, std::path::PathBuf) {
        let path = temp_db_path(name);
        let db = Arc::new(BotDatabase::new(&path, 2).expect("db init"));
        (
            MessageTracker::new(db, ChronoDuration::hours(72), max_rows, prune_every),
            path,
        )
    }

    #[test]
    fn retention_holds_after_each_prune_round() {
        let (tracker, path) = tracker("tracker_retention", 25, 10);
        let now = Utc::now();

        // Old rows that must disappear on the first prune.
        for id in 0..5 {
            tracker
                .track_at(id, now - ChronoDuration::hours(100))
                .unwrap();
        }
        for id in 5..40 {
            tracker
                .track_at(id, now - ChronoDuration::seconds(40 - id))
                .unwrap();
        }

        // 40 calls = 4 prune rounds.
        assert!(tracker.tracked_count().unwrap() <= 25);
        let ids: HashSet<i64> = tracker.db.tracked_message_ids().unwrap().into_iter().collect();
        for old in 0..5 {
            assert!(!ids.contains(&old));
        }
        assert!(ids.contains(&39));
        cleanup(&path);
    }

    #[test]
    fn no_prune_between_rounds() {
        let (tracker, path) = tracker("tracker_between", 2, 100);
        for id in 0..10 {
            tracker.track(id).unwrap();
        }
        assert_eq!(tracker.tracked_count().unwrap(), 10);
        cleanup(&path);
    }

    #[tokio::test]
    async fn sweep_keeps_failures_and_second_sweep_empties() {
        let (tracker, path) = tracker("tracker_sweep", 100, 1000);
        for id in 1..=5 {
            tracker.track(id).unwrap();
        }

        let kept = tracker
            .sweep_and_clear(|id| async move { id % 2 == 0 })
            .await
            .unwrap();
        assert_eq!(kept, 3);
        let mut left = tracker.db.tracked_message_ids().unwrap();
        left.sort();
        assert_eq!(left, vec![1, 3, 5]);

        let kept = tracker
            .sweep_and_clear(|_| async { true })
            .await
            .unwrap();
        assert_eq!(kept, 0);
        assert_eq!(tracker.tracked_count().unwrap(), 0);
        cleanup(&path);
    }
}

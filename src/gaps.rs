// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Gap tracking and bounded backfill.
//!
//! The log store assigns ids before commit, so under concurrent writers a
//! row with a lower id can become visible *after* a row with a higher one.
//! Reading strictly in id order and never looking back would skip those
//! rows for good. Instead, every discontinuity seen while reading is
//! recorded as a gap and re-checked at the start of each run:
//!
//! ```text
//! previous = 100, batch = [101, 102, 105]
//!                              └── gaps {103, 104} recorded
//!
//! next run: 103 visible → dispatched, removed
//!           104 missing, older than retry window → abandoned (warn)
//! ```
//!
//! # Persistence
//!
//! Gaps live in memory and are written through a [`GapStore`] on
//! [`GapTracker::flush`], the same dirty-set approach the bookmark cache
//! used to take. Persistence is best effort: a failed write is logged and
//! retried on the next flush, it never fails the batch.

use crate::config::GapConfig;
use crate::dispatch::EntryHandler;
use crate::error::{BoxFuture, Result};
use crate::log::EventLog;
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// An id known to be missing between two observed ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapRecord {
    pub id: i64,
    pub first_seen_at: DateTime<Utc>,
}

/// Durable storage for outstanding gaps.
pub trait GapStore: Send + Sync {
    fn load_gaps(&self) -> BoxFuture<'_, Vec<GapRecord>>;

    /// Insert records; ids already stored keep their original timestamp.
    fn save_gaps<'a>(&'a self, gaps: &'a [GapRecord]) -> BoxFuture<'a, ()>;

    fn remove_gaps<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, ()>;
}

/// Outcome of a [`GapTracker::fill_gaps`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FillSummary {
    /// Gaps whose entry showed up and was dispatched.
    pub resolved: usize,
    /// Gaps given up on because they outlived the retry window.
    pub abandoned: usize,
    /// Gaps still being waited on.
    pub outstanding: usize,
}

/// Detects discontinuities in the id sequence and backfills them.
pub struct GapTracker {
    previous_id: Option<i64>,
    gaps: BTreeMap<i64, GapRecord>,
    retry_window: Duration,
    max_tracked: usize,
    store: Option<Arc<dyn GapStore>>,
    /// Recorded but not yet persisted.
    unsaved: BTreeSet<i64>,
    /// Removed but not yet deleted from the store.
    removed: BTreeSet<i64>,
}

impl GapTracker {
    /// Create an in-memory tracker.
    pub fn new(config: &GapConfig) -> Self {
        Self {
            previous_id: None,
            gaps: BTreeMap::new(),
            retry_window: config.retry_window_duration(),
            max_tracked: config.max_tracked_gaps.max(1),
            store: None,
            unsaved: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Persist gaps through `store`.
    pub fn with_store(mut self, store: Arc<dyn GapStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reload gaps recorded by a previous run.
    ///
    /// Returns the number of gaps restored.
    pub async fn restore(&mut self) -> Result<usize> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let records = store.load_gaps().await?;
        let mut restored = 0;
        for record in records {
            if self.gaps.insert(record.id, record).is_none() {
                restored += 1;
            }
        }

        if restored > 0 {
            info!(count = restored, "Restored gaps from previous run");
        }
        metrics::set_outstanding_gaps(self.gaps.len());
        Ok(restored)
    }

    /// Set the baseline for discontinuity detection (the previous batch's last id).
    pub fn set_previous_id(&mut self, id: i64) {
        self.previous_id = Some(id);
    }

    pub fn previous_id(&self) -> Option<i64> {
        self.previous_id
    }

    /// Observe `id`, recording every id skipped since the previous one.
    ///
    /// Returns the number of newly recorded gaps.
    pub fn check(&mut self, id: i64, now: DateTime<Utc>) -> usize {
        if self.gaps.remove(&id).is_some() {
            debug!(id, "Gap filled in sequence");
            self.mark_removed(id);
            metrics::record_gaps_resolved(1);
        }

        let mut recorded = 0;
        if let Some(previous) = self.previous_id {
            if id > previous.saturating_add(1) {
                recorded = self.record_range(previous + 1, id, now);
            }
        }

        if self.previous_id.map_or(true, |previous| id > previous) {
            self.previous_id = Some(id);
        }

        if recorded > 0 {
            metrics::record_gaps_detected(recorded);
            self.enforce_limit();
            metrics::set_outstanding_gaps(self.gaps.len());
        }
        recorded
    }

    /// Record ids in `[from, to)`.
    fn record_range(&mut self, from: i64, to: i64, now: DateTime<Utc>) -> usize {
        let width = to.abs_diff(from);
        let mut start = from;

        // Keep the ids nearest the head; a jump wider than the whole budget
        // is abandoned up front instead of being materialized.
        if width > self.max_tracked as u64 {
            start = to - self.max_tracked as i64;
            let skipped = usize::try_from(width - self.max_tracked as u64).unwrap_or(usize::MAX);
            warn!(
                from,
                to = start - 1,
                count = skipped,
                "Gap wider than max_tracked_gaps, abandoning oldest ids; these events may be lost"
            );
            metrics::record_gaps_abandoned(skipped, "overflow");
        }

        let mut recorded = 0;
        for missing in start..to {
            if self.gaps.contains_key(&missing) {
                continue;
            }
            self.gaps.insert(
                missing,
                GapRecord {
                    id: missing,
                    first_seen_at: now,
                },
            );
            self.removed.remove(&missing);
            self.unsaved.insert(missing);
            recorded += 1;
        }

        if recorded > 0 {
            debug!(from = start, to = to - 1, recorded, "Recorded gaps");
        }
        recorded
    }

    /// Abandon the oldest gaps while over `max_tracked`.
    fn enforce_limit(&mut self) {
        let excess = self.gaps.len().saturating_sub(self.max_tracked);
        if excess == 0 {
            return;
        }

        let oldest: Vec<i64> = self.gaps.keys().take(excess).copied().collect();
        for id in &oldest {
            self.gaps.remove(id);
            self.mark_removed(*id);
        }
        warn!(
            count = excess,
            ids = ?oldest,
            "Too many outstanding gaps, abandoning oldest; these events may be lost"
        );
        metrics::record_gaps_abandoned(excess, "overflow");
    }

    /// Re-check every outstanding gap against the log.
    ///
    /// Entries that now exist are dispatched through `handler` and removed.
    /// Missing ids older than the retry window are abandoned. A handler
    /// error stops the pass and leaves the failing gap outstanding.
    pub async fn fill_gaps(
        &mut self,
        log: &dyn EventLog,
        handler: &dyn EntryHandler,
        now: DateTime<Utc>,
    ) -> Result<FillSummary> {
        let mut summary = FillSummary::default();
        let result = self.fill_gaps_inner(log, handler, now, &mut summary).await;

        self.flush().await;
        summary.outstanding = self.gaps.len();
        metrics::set_outstanding_gaps(summary.outstanding);

        result.map(|()| summary)
    }

    async fn fill_gaps_inner(
        &mut self,
        log: &dyn EventLog,
        handler: &dyn EntryHandler,
        now: DateTime<Utc>,
        summary: &mut FillSummary,
    ) -> Result<()> {
        if self.gaps.is_empty() {
            return Ok(());
        }

        let ids: Vec<i64> = self.gaps.keys().copied().collect();
        debug!(count = ids.len(), "Checking outstanding gaps");

        let mut abandoned = Vec::new();
        for id in ids {
            match log.get(id).await? {
                Some(entry) => {
                    handler.handle(&entry).await?;
                    self.gaps.remove(&id);
                    self.mark_removed(id);
                    summary.resolved += 1;
                    debug!(id, "Backfilled gap");
                }
                None => {
                    let expired = self
                        .gaps
                        .get(&id)
                        .is_some_and(|record| self.is_expired(record, now));
                    if expired {
                        self.gaps.remove(&id);
                        self.mark_removed(id);
                        abandoned.push(id);
                    }
                }
            }
        }

        if summary.resolved > 0 {
            info!(count = summary.resolved, "Backfilled gaps");
            metrics::record_gaps_resolved(summary.resolved);
        }
        if !abandoned.is_empty() {
            warn!(
                count = abandoned.len(),
                ids = ?abandoned,
                retry_window_secs = self.retry_window.as_secs(),
                "Abandoning gaps past retry window; these events may be lost"
            );
            metrics::record_gaps_abandoned(abandoned.len(), "expired");
            summary.abandoned = abandoned.len();
        }
        Ok(())
    }

    fn is_expired(&self, record: &GapRecord, now: DateTime<Utc>) -> bool {
        // Negative age (clock skew) counts as fresh.
        now.signed_duration_since(record.first_seen_at)
            .to_std()
            .map(|age| age > self.retry_window)
            .unwrap_or(false)
    }

    fn mark_removed(&mut self, id: i64) {
        if !self.unsaved.remove(&id) {
            self.removed.insert(id);
        }
    }

    /// Write pending changes to the gap store.
    ///
    /// Best effort: failures are logged and the changes stay pending.
    pub async fn flush(&mut self) {
        let Some(store) = self.store.clone() else {
            self.unsaved.clear();
            self.removed.clear();
            return;
        };

        if !self.unsaved.is_empty() {
            let records: Vec<GapRecord> = self
                .unsaved
                .iter()
                .filter_map(|id| self.gaps.get(id).copied())
                .collect();
            match store.save_gaps(&records).await {
                Ok(()) => self.unsaved.clear(),
                Err(e) => warn!(error = %e, count = records.len(), "Failed to persist gaps"),
            }
        }

        if !self.removed.is_empty() {
            let ids: Vec<i64> = self.removed.iter().copied().collect();
            match store.remove_gaps(&ids).await {
                Ok(()) => self.removed.clear(),
                Err(e) => warn!(error = %e, count = ids.len(), "Failed to delete resolved gaps"),
            }
        }
    }

    /// Whether there are changes not yet written to the store.
    pub fn has_unflushed(&self) -> bool {
        !self.unsaved.is_empty() || !self.removed.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.gaps.len()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.gaps.contains_key(&id)
    }

    pub fn get(&self, id: i64) -> Option<&GapRecord> {
        self.gaps.get(&id)
    }

    /// Outstanding gap ids, ascending.
    pub fn ids(&self) -> Vec<i64> {
        self.gaps.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchOutcome;
    use crate::error::CursorError;
    use crate::log::EventLogEntry;
    use crate::memory::{MemoryEventLog, MemoryStateStore};
    use std::sync::Mutex;

    /// Records every dispatched id; fails for ids in `fail_on`.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<i64>>,
        fail_on: Vec<i64>,
    }

    impl RecordingHandler {
        fn seen(&self) -> Vec<i64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl EntryHandler for RecordingHandler {
        fn handle<'a>(&'a self, entry: &'a EventLogEntry) -> BoxFuture<'a, DispatchOutcome> {
            Box::pin(async move {
                if self.fail_on.contains(&entry.id) {
                    return Err(CursorError::handler("Test", "boom"));
                }
                self.seen.lock().unwrap().push(entry.id);
                Ok(DispatchOutcome::Processed)
            })
        }
    }

    fn tracker() -> GapTracker {
        GapTracker::new(&GapConfig {
            retry_window: "10m".to_string(),
            max_tracked_gaps: 100,
        })
    }

    fn minutes_ago(now: DateTime<Utc>, minutes: i64) -> DateTime<Utc> {
        now - chrono::Duration::minutes(minutes)
    }

    #[test]
    fn test_check_records_open_interval() {
        let mut gaps = tracker();
        let now = Utc::now();
        gaps.set_previous_id(100);

        assert_eq!(gaps.check(101, now), 0);
        assert_eq!(gaps.check(102, now), 0);
        assert_eq!(gaps.check(105, now), 2);

        assert_eq!(gaps.ids(), vec![103, 104]);
        assert_eq!(gaps.previous_id(), Some(105));
        assert_eq!(gaps.get(103).unwrap().first_seen_at, now);
    }

    #[test]
    fn test_check_without_baseline_records_nothing() {
        let mut gaps = tracker();
        assert_eq!(gaps.check(500, Utc::now()), 0);
        assert_eq!(gaps.outstanding(), 0);
        assert_eq!(gaps.previous_id(), Some(500));
    }

    #[test]
    fn test_check_keeps_original_first_seen() {
        let mut gaps = tracker();
        let earlier = minutes_ago(Utc::now(), 5);
        let now = Utc::now();

        gaps.set_previous_id(10);
        gaps.check(13, earlier);

        // Same range re-read after a failed batch
        gaps.set_previous_id(10);
        assert_eq!(gaps.check(13, now), 0);
        assert_eq!(gaps.get(11).unwrap().first_seen_at, earlier);
    }

    #[test]
    fn test_check_resolves_recorded_id() {
        let mut gaps = tracker();
        let now = Utc::now();
        gaps.set_previous_id(1);
        gaps.check(4, now);
        assert!(gaps.contains(2));

        gaps.set_previous_id(1);
        gaps.check(2, now);
        assert!(!gaps.contains(2));
        assert!(gaps.contains(3));
    }

    #[test]
    fn test_wide_jump_is_capped() {
        let mut gaps = GapTracker::new(&GapConfig {
            retry_window: "10m".to_string(),
            max_tracked_gaps: 5,
        });
        gaps.set_previous_id(0);
        let recorded = gaps.check(1_000_000, Utc::now());

        assert_eq!(recorded, 5);
        assert_eq!(gaps.ids(), vec![999_995, 999_996, 999_997, 999_998, 999_999]);
    }

    #[test]
    fn test_limit_abandons_oldest() {
        let mut gaps = GapTracker::new(&GapConfig {
            retry_window: "10m".to_string(),
            max_tracked_gaps: 3,
        });
        let now = Utc::now();
        gaps.set_previous_id(0);
        gaps.check(3, now); // gaps 1, 2
        gaps.check(6, now); // gaps 4, 5 -> over limit by one

        assert_eq!(gaps.ids(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_fill_gaps_resolves_and_abandons() {
        let log = MemoryEventLog::new();
        let now = Utc::now();
        let mut gaps = tracker();

        gaps.set_previous_id(100);
        gaps.check(105, minutes_ago(now, 15)); // 101..=104, all stale

        log.insert_entry(MemoryEventLog::entry(103, "RecordUpdate", None));

        let handler = RecordingHandler::default();
        let summary = gaps.fill_gaps(&log, &handler, now).await.unwrap();

        assert_eq!(handler.seen(), vec![103]);
        assert_eq!(
            summary,
            FillSummary {
                resolved: 1,
                abandoned: 3,
                outstanding: 0
            }
        );
    }

    #[tokio::test]
    async fn test_fill_gaps_keeps_fresh_missing_ids() {
        let log = MemoryEventLog::new();
        let now = Utc::now();
        let mut gaps = tracker();

        gaps.set_previous_id(1);
        gaps.check(4, minutes_ago(now, 1));

        let handler = RecordingHandler::default();
        let summary = gaps.fill_gaps(&log, &handler, now).await.unwrap();

        assert_eq!(summary.resolved, 0);
        assert_eq!(summary.abandoned, 0);
        assert_eq!(summary.outstanding, 2);
        assert!(handler.seen().is_empty());
    }

    #[tokio::test]
    async fn test_fill_gaps_dispatches_exactly_once() {
        let log = MemoryEventLog::new();
        let now = Utc::now();
        let mut gaps = tracker();

        gaps.set_previous_id(1);
        gaps.check(3, now);
        log.insert_entry(MemoryEventLog::entry(2, "RecordUpdate", None));

        let handler = RecordingHandler::default();
        gaps.fill_gaps(&log, &handler, now).await.unwrap();
        gaps.fill_gaps(&log, &handler, now).await.unwrap();

        assert_eq!(handler.seen(), vec![2]);
        assert_eq!(gaps.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_fill_gaps_handler_error_leaves_gap() {
        let log = MemoryEventLog::new();
        let now = Utc::now();
        let mut gaps = tracker();

        gaps.set_previous_id(1);
        gaps.check(4, now);
        log.insert_entry(MemoryEventLog::entry(2, "RecordUpdate", None));
        log.insert_entry(MemoryEventLog::entry(3, "RecordUpdate", None));

        let handler = RecordingHandler {
            fail_on: vec![3],
            ..Default::default()
        };
        let result = gaps.fill_gaps(&log, &handler, now).await;

        assert!(result.is_err());
        assert_eq!(handler.seen(), vec![2]);
        assert_eq!(gaps.ids(), vec![3]);
    }

    #[tokio::test]
    async fn test_flush_and_restore_through_store() {
        let store = Arc::new(MemoryStateStore::new());
        let now = Utc::now();

        {
            let mut gaps = tracker().with_store(store.clone());
            gaps.set_previous_id(10);
            gaps.check(14, now); // 11, 12, 13
            assert!(gaps.has_unflushed());
            gaps.flush().await;
            assert!(!gaps.has_unflushed());

            gaps.set_previous_id(10);
            gaps.check(12, now); // resolves 12
            gaps.flush().await;
        }

        let mut restored = tracker().with_store(store);
        assert_eq!(restored.restore().await.unwrap(), 2);
        assert_eq!(restored.ids(), vec![11, 13]);
        assert_eq!(restored.get(11).unwrap().first_seen_at, now);
    }

    #[tokio::test]
    async fn test_resolved_before_flush_never_hits_store() {
        let store = Arc::new(MemoryStateStore::new());
        let mut gaps = tracker().with_store(store.clone());
        let now = Utc::now();

        gaps.set_previous_id(1);
        gaps.check(3, now);
        gaps.set_previous_id(1);
        gaps.check(2, now);
        gaps.flush().await;

        assert!(!gaps.has_unflushed());
        assert!(store.load_gaps().await.unwrap().is_empty());
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end cursor scenarios over in-memory and SQLite collaborators.
//!
//! Run with: cargo test --test cursor_scenarios -- --nocapture

mod common;

use common::{publish, HarnessBuilder, Recorded, KIND};
use replication_cursor::memory::{LocalLease, MemoryEventLog, MemoryScopes, StaticRole};
use replication_cursor::{
    BookmarkStore, Collaborators, CursorConfig, CursorDaemon, DaemonState, GapStore, IterationOutcome, Lease,
    SqliteStore, StopReason, StoreConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn completed(outcome: IterationOutcome) -> replication_cursor::daemon::EventsReport {
    match outcome {
        IterationOutcome::Completed(report) => report,
        other => panic!("expected a completed iteration, got {other:?}"),
    }
}

// =============================================================================
// Gap detection and backfill
// =============================================================================

/// Bookmark 100, batch [101, 102, 105]: gaps 103 and 104 are recorded.
/// Later 103 shows up and is dispatched; 104 never does and is abandoned.
#[tokio::test(start_paused = true)]
async fn out_of_order_visibility_is_backfilled() {
    let mut h = HarnessBuilder::new()
        .bookmark(100)
        .config(|c| c.gaps.retry_window = "10m".to_string())
        .build();

    publish(&h.log, &[101, 102, 105]);
    let report = completed(h.daemon.run_once().await);

    assert_eq!(h.recorded.ids(), vec![101, 102, 105]);
    assert_eq!(report.read.last_id, 105);
    assert_eq!(h.store.bookmark(), Some(105));
    assert_eq!(h.store.gap_ids(), vec![103, 104]);
    assert_eq!(h.daemon.status().outstanding_gaps, 2);

    // 103 commits late; 104 was rolled back. Let the retry window pass.
    publish(&h.log, &[103]);
    h.clock.advance(Duration::from_secs(11 * 60));

    let report = completed(h.daemon.run_once().await);
    assert_eq!(report.gaps.resolved, 1);
    assert_eq!(report.gaps.abandoned, 1);
    assert_eq!(report.gaps.outstanding, 0);

    assert_eq!(h.recorded.ids(), vec![101, 102, 105, 103]);
    assert_eq!(h.store.bookmark(), Some(105));
    assert!(h.store.gap_ids().is_empty());
}

/// A gap that fills inside the window is dispatched exactly once.
#[tokio::test(start_paused = true)]
async fn gap_filled_within_window_dispatched_once() {
    let mut h = HarnessBuilder::new().bookmark(0).build();

    publish(&h.log, &[1, 3]);
    completed(h.daemon.run_once().await);
    assert_eq!(h.store.gap_ids(), vec![2]);

    publish(&h.log, &[2]);
    completed(h.daemon.run_once().await);
    completed(h.daemon.run_once().await);

    assert_eq!(h.recorded.ids(), vec![1, 3, 2]);
    assert!(h.store.gap_ids().is_empty());
}

// =============================================================================
// Bookmark behaviour
// =============================================================================

/// No new entries: nothing is dispatched and the bookmark is not rewritten.
#[tokio::test(start_paused = true)]
async fn idempotent_rerun() {
    let mut h = HarnessBuilder::new().bookmark(0).build();
    publish(&h.log, &[1, 2, 3]);

    completed(h.daemon.run_once().await);
    let writes = h.store.bookmark_writes();
    h.recorded.clear();

    let report = completed(h.daemon.run_once().await);
    assert_eq!(report.read.batches, 0);
    assert_eq!(report.read.stop, StopReason::Drained);
    assert!(h.recorded.ids().is_empty());
    assert_eq!(h.store.bookmark(), Some(3));
    assert_eq!(h.store.bookmark_writes(), writes);
}

/// A node with no bookmark starts at the current head of the log.
#[tokio::test(start_paused = true)]
async fn fresh_start_begins_at_log_head() {
    let mut h = HarnessBuilder::new().build();
    for _ in 0..5 {
        h.log.append(KIND, None);
    }

    completed(h.daemon.run_once().await);
    assert!(h.recorded.ids().is_empty());
    assert_eq!(h.store.bookmark(), Some(5));

    h.log.append(KIND, None);
    h.log.append(KIND, None);
    completed(h.daemon.run_once().await);
    assert_eq!(h.recorded.ids(), vec![6, 7]);
}

/// Large backlogs are read in chunks of `batch_size`.
#[tokio::test(start_paused = true)]
async fn backlog_read_in_chunks() {
    let mut h = HarnessBuilder::new().bookmark(0).build();
    for _ in 0..35 {
        h.log.append(KIND, None);
    }

    let report = completed(h.daemon.run_once().await);
    assert_eq!(report.read.batches, 4);
    assert_eq!(report.read.events, 35);
    assert_eq!(h.recorded.ids(), (1..=35).collect::<Vec<_>>());
    assert_eq!(h.store.bookmark(), Some(35));
}

// =============================================================================
// Lease contention
// =============================================================================

/// Without the lease an instance still reads, but only one chunk.
#[tokio::test(start_paused = true)]
async fn instance_without_lease_reads_one_chunk() {
    let holder = LocalLease::new();
    let contender = holder.contender();
    let granted = holder
        .try_acquire("replication_cursor:test", Duration::from_secs(600))
        .await
        .unwrap();
    assert!(granted.granted);

    let mut h = HarnessBuilder::new()
        .bookmark(0)
        .lease(contender)
        .config(|c| c.reader.batch_size = 2)
        .build();
    for _ in 0..6 {
        h.log.append(KIND, None);
    }

    let report = completed(h.daemon.run_once().await);
    assert!(!report.lease_granted);
    assert_eq!(report.read.stop, StopReason::LeaseLost);
    assert_eq!(h.recorded.ids(), vec![1, 2]);
    assert_eq!(h.store.bookmark(), Some(2));
}

// =============================================================================
// Scopes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn out_of_shard_entries_are_skipped_but_passed() {
    let scopes = Arc::new(MemoryScopes::new());
    scopes.add_scope(1, true);
    scopes.add_scope(2, false);

    let mut h = HarnessBuilder::new().bookmark(0).scopes(scopes.clone()).build();
    h.log.append(KIND, Some(1));
    h.log.append(KIND, Some(2));
    h.log.append(KIND, Some(3)); // deleted scope, replayed
    h.log.append(KIND, None);

    completed(h.daemon.run_once().await);
    assert_eq!(h.recorded.ids(), vec![1, 3, 4]);
    assert_eq!(h.store.bookmark(), Some(4));
}

/// Entries whose payload no longer resolves are skipped, not failed.
#[tokio::test(start_paused = true)]
async fn unresolved_payloads_are_skipped() {
    let mut h = HarnessBuilder::new().bookmark(0).build();
    publish(&h.log, &[1, 3]);
    let mut orphan = MemoryEventLog::entry(2, KIND, None);
    orphan.payload = None;
    h.log.insert_entry(orphan);

    completed(h.daemon.run_once().await);
    assert_eq!(h.recorded.ids(), vec![1, 3]);
    assert_eq!(h.store.bookmark(), Some(3));
    assert!(h.store.gap_ids().is_empty());
}

// =============================================================================
// Role changes
// =============================================================================

#[tokio::test(start_paused = true)]
async fn promotion_to_primary_stops_reading() {
    let mut h = HarnessBuilder::new().bookmark(0).build();
    publish(&h.log, &[1]);
    completed(h.daemon.run_once().await);

    h.role.set_follower(false);
    publish(&h.log, &[2]);
    assert!(matches!(h.daemon.run_once().await, IterationOutcome::NotEligible));
    assert_eq!(h.recorded.ids(), vec![1]);

    h.role.set_follower(true);
    completed(h.daemon.run_once().await);
    assert_eq!(h.recorded.ids(), vec![1, 2]);
}

// =============================================================================
// SQLite persistence
// =============================================================================

/// Bookmark and gaps survive a restart through the SQLite store.
#[tokio::test]
async fn sqlite_state_survives_restart() {
    let dir = tempdir().unwrap();
    let store_config = StoreConfig {
        sqlite_path: dir.path().join("cursor.db").to_string_lossy().to_string(),
        wal_mode: true,
    };
    let log = Arc::new(MemoryEventLog::new());
    let recorded = Recorded::new();

    let daemon_with = |store: Arc<SqliteStore>| {
        let mut config = CursorConfig::for_testing();
        config.daemon.lease_ttl = "10ms".to_string();
        let collaborators = Collaborators::new(
            Arc::new(StaticRole::follower()),
            Arc::new(LocalLease::new()),
            log.clone(),
            store.clone(),
            recorded.registry(&[KIND]),
        )
        .with_gap_store(store);
        CursorDaemon::new(config, collaborators).unwrap()
    };

    {
        let store = Arc::new(SqliteStore::open(&store_config).await.unwrap());
        store.set(10).await.unwrap();
        publish(&log, &[11, 14]);

        let mut daemon = daemon_with(store.clone());
        completed(daemon.run_once().await);
        assert_eq!(store.get().await.unwrap(), Some(14));
        store.close().await;
    }

    publish(&log, &[12]);

    {
        let store = Arc::new(SqliteStore::open(&store_config).await.unwrap());
        let persisted: Vec<i64> = store.load_gaps().await.unwrap().iter().map(|g| g.id).collect();
        assert_eq!(persisted, vec![12, 13]);

        let mut daemon = daemon_with(store.clone());
        let report = completed(daemon.run_once().await);
        assert_eq!(report.gaps.resolved, 1);

        let remaining: Vec<i64> = store.load_gaps().await.unwrap().iter().map(|g| g.id).collect();
        assert_eq!(remaining, vec![13]);
        store.close().await;
    }

    assert_eq!(recorded.ids(), vec![11, 14, 12]);
}

/// Status reflects the last completed pass.
#[tokio::test(start_paused = true)]
async fn status_snapshot() {
    let mut h = HarnessBuilder::new().bookmark(0).build();
    assert_eq!(h.daemon.state(), DaemonState::Idle);
    assert_eq!(h.daemon.status().bookmark, None);

    publish(&h.log, &[1, 2]);
    completed(h.daemon.run_once().await);

    let status = h.daemon.status();
    assert_eq!(status.bookmark, Some(2));
    assert_eq!(status.iterations, 1);
    assert_eq!(status.exit, None);
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-batch processing: gap detection and dispatch.
//!
//! Every entry is first checked against the gap tracker (so holes are
//! recorded even if dispatch fails midway) and then dispatched in order.
//! Gaps are flushed before returning, which means before the reader
//! advances the bookmark past them.

use super::types::DaemonState;
use crate::clock::Clock;
use crate::dispatch::Dispatcher;
use crate::error::BoxFuture;
use crate::gaps::GapTracker;
use crate::log::EventLogEntry;
use crate::metrics;
use crate::reader::BatchSink;
use tokio::sync::watch;
use tracing::debug;

pub(super) struct DispatchSink<'d> {
    pub(super) gaps: &'d mut GapTracker,
    pub(super) dispatcher: &'d Dispatcher,
    pub(super) clock: &'d dyn Clock,
    pub(super) state_tx: &'d watch::Sender<DaemonState>,
}

impl DispatchSink<'_> {
    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
        metrics::set_daemon_state(&state.to_string());
    }
}

impl BatchSink for DispatchSink<'_> {
    fn on_batch<'a>(&'a mut self, batch: &'a [EventLogEntry], previous_last_id: i64) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.set_state(DaemonState::Processing);

            let now = self.clock.now();
            self.gaps.set_previous_id(previous_last_id);

            let mut skipped = 0usize;
            let mut new_gaps = 0usize;
            for entry in batch {
                new_gaps += self.gaps.check(entry.id, now);
                if self.dispatcher.handle_single(entry).await?.is_skip() {
                    skipped += 1;
                }
            }

            self.gaps.flush().await;
            debug!(
                size = batch.len(),
                skipped,
                new_gaps,
                outstanding_gaps = self.gaps.outstanding(),
                "Batch dispatched"
            );

            self.set_state(DaemonState::Fetching);
            Ok(())
        })
    }
}

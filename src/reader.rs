// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batch reader: pulls ordered chunks after the bookmark.
//!
//! Each chunk is handed to a [`BatchSink`] and only then is the bookmark
//! advanced to the chunk's last id:
//!
//! ```text
//! bookmark 100 → query id > 100 limit N → sink.on_batch(chunk, 100)
//!              → bookmark.set(chunk.last) → lease.renew()
//!              → next chunk from chunk.last
//! ```
//!
//! # Stopping
//!
//! - A chunk shorter than `batch_size` means the log is drained.
//! - A failed lease renewal means another instance may be reading; stop
//!   and let the next iteration contend for the lease again.
//! - Shutdown is checked between chunks; an in-flight chunk completes.
//!
//! A sink error propagates without touching the bookmark, so the whole
//! chunk is re-read next time.

use crate::bookmark::BookmarkStore;
use crate::error::{BoxFuture, Result};
use crate::lease::Lease;
use crate::log::{EventLog, EventLogEntry};
use crate::metrics;
use crate::shutdown::ShutdownSignal;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

/// Receives each chunk before the bookmark moves past it.
pub trait BatchSink: Send {
    /// `previous_last_id` is the bookmark the chunk was read after.
    fn on_batch<'a>(&'a mut self, batch: &'a [EventLogEntry], previous_last_id: i64) -> BoxFuture<'a, ()>;
}

/// Why [`BatchReader::fetch_in_batches`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Caught up with the head of the log.
    Drained,
    LeaseLost,
    Shutdown,
}

/// What a read pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSummary {
    pub batches: usize,
    pub events: usize,
    /// Bookmark at the end of the pass.
    pub last_id: i64,
    pub stop: StopReason,
}

/// Reads the event log in bookmark order.
pub struct BatchReader {
    log: Arc<dyn EventLog>,
    bookmarks: Arc<dyn BookmarkStore>,
    lease: Arc<dyn Lease>,
    lease_key: String,
    batch_size: usize,
    shutdown: ShutdownSignal,
}

impl BatchReader {
    pub fn new(
        log: Arc<dyn EventLog>,
        bookmarks: Arc<dyn BookmarkStore>,
        lease: Arc<dyn Lease>,
        lease_key: impl Into<String>,
        batch_size: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            log,
            bookmarks,
            lease,
            lease_key: lease_key.into(),
            batch_size: batch_size.max(1),
            shutdown,
        }
    }

    /// The id to read after: the stored bookmark, or on first start the
    /// log's current head (persisted immediately).
    ///
    /// A fresh node starts from the head; history before it is expected to
    /// arrive through the initial copy, not through the cursor.
    pub async fn starting_point(&self) -> Result<i64> {
        if let Some(bookmark) = self.bookmarks.get().await? {
            return Ok(bookmark);
        }

        let head = self.log.max_id().await?.unwrap_or(0);
        self.bookmarks.set(head).await?;
        info!(bookmark = head, "No bookmark found, starting from log head");
        metrics::set_bookmark(head);
        Ok(head)
    }

    /// Read and hand off chunks until drained, lease lost, or shutdown.
    pub async fn fetch_in_batches(&self, sink: &mut dyn BatchSink) -> Result<ReadSummary> {
        let mut cursor = self.starting_point().await?;
        let mut batches = 0;
        let mut events = 0;

        let stop = loop {
            if self.shutdown.is_triggered() {
                debug!(bookmark = cursor, "Shutdown requested, stopping read");
                break StopReason::Shutdown;
            }

            let batch = self.log.query_after(cursor, self.batch_size).await?;
            let (first_id, last_id) = match (batch.first(), batch.last()) {
                (Some(first), Some(last)) => (first.id, last.id),
                _ => break StopReason::Drained,
            };

            let started = Instant::now();
            let span = info_span!("batch", first_id, last_id, size = batch.len());
            sink.on_batch(&batch, cursor).instrument(span).await?;

            self.bookmarks.set(last_id).await?;
            metrics::record_batch(batch.len(), started.elapsed());
            debug!(previous = cursor, bookmark = last_id, size = batch.len(), "Batch complete, bookmark advanced");

            cursor = last_id;
            batches += 1;
            events += batch.len();

            if batch.len() < self.batch_size {
                break StopReason::Drained;
            }

            let renewed = match self.lease.renew(&self.lease_key).await {
                Ok(renewed) => renewed,
                Err(e) if e.is_shutdown() => return Err(e),
                Err(e) => {
                    warn!(lease_key = %self.lease_key, bookmark = cursor, error = %e, "Lease renewal failed");
                    false
                }
            };
            if !renewed {
                warn!(lease_key = %self.lease_key, bookmark = cursor, "Lease lost, stopping read");
                metrics::record_lease_lost();
                break StopReason::LeaseLost;
            }
        };

        if batches > 0 {
            info!(batches, events, bookmark = cursor, stop = ?stop, "Read pass finished");
        }

        Ok(ReadSummary {
            batches,
            events,
            last_id: cursor,
            stop,
        })
    }
}

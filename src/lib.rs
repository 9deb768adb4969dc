//! # Replication Cursor
//!
//! Follower-side cursor that tails a primary's append-only event log and
//! replays each event locally, so the follower converges to the primary.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                            CursorDaemon                                   │
//! │                                                                           │
//! │  NodeRole ──► Lease ──► GapTracker.fill_gaps ──► BatchReader              │
//! │  (follower?)  (advisory)  (backfill holes)       (id > bookmark, chunks)  │
//! │                               │                        │                  │
//! │                               ▼                        ▼                  │
//! │                         ┌─────────────────────────────────────────┐       │
//! │                         │ Dispatcher → HandlerRegistry → process  │       │
//! │                         └─────────────────────────────────────────┘       │
//! │                                                        │                  │
//! │                                                        ▼                  │
//! │                                  ┌─────────────────────────────────┐      │
//! │                                  │ SqliteStore (bookmark + gaps)   │      │
//! │                                  └─────────────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: the bookmark only moves after a whole chunk was
//!   dispatched; a crash re-reads the chunk. Handlers must be idempotent.
//! - **No silent loss**: ids skipped in the sequence are tracked as gaps and
//!   backfilled; a gap is only dropped after the retry window, with a warning.
//! - **Bounded failure**: an elapsed-time error budget stops the daemon
//!   rather than letting it spin on a broken dependency forever.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replication_cursor::memory::{LocalLease, MemoryEventLog, StaticRole};
//! use replication_cursor::{Collaborators, CursorConfig, CursorDaemon, HandlerRegistry, SqliteStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> replication_cursor::Result<()> {
//!     let config = CursorConfig::default();
//!     let store = Arc::new(SqliteStore::open(&config.store).await?);
//!
//!     let handlers = HandlerRegistry::new();
//!     // handlers.register("AccountUpdate", |payload, created_at| ...);
//!
//!     let collaborators = Collaborators::new(
//!         Arc::new(StaticRole::follower()),
//!         Arc::new(LocalLease::new()),
//!         Arc::new(MemoryEventLog::new()),
//!         store.clone(),
//!         handlers,
//!     )
//!     .with_gap_store(store.clone());
//!
//!     let mut daemon = CursorDaemon::new(config, collaborators)?;
//!     tokio::spawn(replication_cursor::shutdown::listen_for_signals(daemon.shutdown_handle()));
//!
//!     let reason = daemon.run().await;
//!     store.close().await;
//!     println!("cursor stopped: {reason}");
//!     Ok(())
//! }
//! ```

pub mod bookmark;
pub mod budget;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod error;
pub mod gaps;
pub mod lease;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod reader;
pub mod shutdown;

// Re-exports for convenience
pub use bookmark::{BookmarkStore, SqliteStore};
pub use budget::{BudgetStatus, ErrorBudget};
pub use clock::{Clock, SystemClock};
pub use config::{CursorConfig, DaemonConfig, GapConfig, ReaderConfig, StoreConfig};
pub use daemon::{Collaborators, CursorDaemon, DaemonState, DaemonStatus, ExitReason, IterationOutcome};
pub use dispatch::{DispatchOutcome, Dispatcher, EntryHandler, Handler, HandlerRegistry};
pub use error::{BoxFuture, CursorError, Result};
pub use gaps::{FillSummary, GapRecord, GapStore, GapTracker};
pub use lease::{Lease, LeaseGrant};
pub use log::{EventLog, EventLogEntry, Payload};
pub use node::{NodeRole, ScopePolicy};
pub use reader::{BatchReader, BatchSink, ReadSummary, StopReason};
pub use shutdown::{ShutdownHandle, ShutdownSignal};

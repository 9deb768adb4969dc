// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor daemon: the control loop.
//!
//! Ties together:
//! - Role checks via [`NodeRole`]
//! - The advisory [`Lease`]
//! - Gap backfill via [`GapTracker`]
//! - Batch reading via [`BatchReader`] and dispatch via [`Dispatcher`]
//! - The elapsed-time [`ErrorBudget`]
//!
//! # Iteration
//!
//! ```text
//! run_once():
//!   follower?  no  → sleep(role_check_interval)
//!              yes → try_acquire(lease)        (outcome logged, never fatal)
//!                  → fill_gaps → fetch_in_batches
//!                  → error budget ← success / failure
//!                  → sleep(lease_ttl + jitter)
//! ```
//!
//! The lease is advisory: the iteration proceeds whether or not it was
//! granted. A non-holder reads at most one chunk before its renewal fails.
//!
//! # Graceful Shutdown
//!
//! [`shutdown_handle()`](CursorDaemon::shutdown_handle) (or
//! [`listen_for_signals`](crate::shutdown::listen_for_signals)) sets the
//! exit flag. Sleeps end immediately, collaborator calls are abandoned,
//! but an event already being handled runs to completion. Pending gap
//! records are flushed before `run()` returns.

mod processing;
mod types;

pub use types::{DaemonState, DaemonStatus, EventsReport, ExitReason, IterationOutcome};

use crate::bookmark::BookmarkStore;
use crate::budget::{BudgetStatus, ErrorBudget};
use crate::clock::{Clock, SystemClock};
use crate::config::CursorConfig;
use crate::dispatch::{Dispatcher, HandlerRegistry};
use crate::error::{CursorError, Result};
use crate::gaps::{GapStore, GapTracker};
use crate::lease::Lease;
use crate::log::EventLog;
use crate::metrics;
use crate::node::{NodeRole, ScopePolicy};
use crate::reader::BatchReader;
use crate::shutdown::{self, CallGuard, Guarded, ShutdownHandle, ShutdownSignal};
use processing::DispatchSink;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Sleep between iterations: `ttl` plus a uniform jitter in `[0, max_jitter]`.
pub fn sleep_duration(ttl: Duration, max_jitter: Duration) -> Duration {
    let max_ms = max_jitter.as_millis() as u64;
    if max_ms == 0 {
        return ttl;
    }
    ttl.saturating_add(Duration::from_millis(rand::rng().random_range(0..=max_ms)))
}

/// External services the daemon runs against.
pub struct Collaborators {
    pub role: Arc<dyn NodeRole>,
    pub lease: Arc<dyn Lease>,
    pub log: Arc<dyn EventLog>,
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub handlers: HandlerRegistry,
    /// Persist gaps across restarts. In-memory only when `None`.
    pub gap_store: Option<Arc<dyn GapStore>>,
    /// Scope existence/shard checks. Every entry is replayed when `None`.
    pub scopes: Option<Arc<dyn ScopePolicy>>,
    /// Wall clock for gap timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        role: Arc<dyn NodeRole>,
        lease: Arc<dyn Lease>,
        log: Arc<dyn EventLog>,
        bookmarks: Arc<dyn BookmarkStore>,
        handlers: HandlerRegistry,
    ) -> Self {
        Self {
            role,
            lease,
            log,
            bookmarks,
            handlers,
            gap_store: None,
            scopes: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_gap_store(mut self, store: Arc<dyn GapStore>) -> Self {
        self.gap_store = Some(store);
        self
    }

    pub fn with_scope_policy(mut self, scopes: Arc<dyn ScopePolicy>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Long-running cursor over the primary's event log.
pub struct CursorDaemon {
    config: CursorConfig,

    role: Arc<dyn NodeRole>,
    lease: Arc<dyn Lease>,
    log: Arc<dyn EventLog>,

    dispatcher: Dispatcher,
    gaps: GapTracker,
    gaps_restored: bool,
    reader: BatchReader,
    budget: ErrorBudget,
    clock: Arc<dyn Clock>,

    /// Daemon state (broadcast to watchers)
    state_tx: watch::Sender<DaemonState>,
    state_rx: watch::Receiver<DaemonState>,

    shutdown: ShutdownHandle,
    signal: ShutdownSignal,

    exit: Option<ExitReason>,
    iterations: u64,
    last_bookmark: Option<i64>,
}

impl CursorDaemon {
    /// Create a daemon. Fails only on invalid configuration.
    ///
    /// Every collaborator call is bounded by `daemon.call_timeout` and
    /// interrupted by shutdown.
    pub fn new(config: CursorConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (shutdown, signal) = shutdown::channel();
        let guard = CallGuard::new(signal.clone(), config.daemon.call_timeout_duration());

        let role: Arc<dyn NodeRole> = Arc::new(Guarded::new(collaborators.role, guard.clone()));
        let lease: Arc<dyn Lease> = Arc::new(Guarded::new(collaborators.lease, guard.clone()));
        let log: Arc<dyn EventLog> = Arc::new(Guarded::new(collaborators.log, guard.clone()));
        let bookmarks: Arc<dyn BookmarkStore> = Arc::new(Guarded::new(collaborators.bookmarks, guard.clone()));

        let mut dispatcher = Dispatcher::new(Arc::new(collaborators.handlers));
        if let Some(scopes) = collaborators.scopes {
            let scopes: Arc<dyn ScopePolicy> = Arc::new(Guarded::new(scopes, guard.clone()));
            dispatcher = dispatcher.with_scope_policy(scopes);
        }

        let mut gaps = GapTracker::new(&config.gaps);
        if let Some(store) = collaborators.gap_store {
            let store: Arc<dyn GapStore> = Arc::new(Guarded::new(store, guard));
            gaps = gaps.with_store(store);
        }

        let reader = BatchReader::new(
            log.clone(),
            bookmarks,
            lease.clone(),
            config.lease_key.clone(),
            config.reader.batch_size,
            signal.clone(),
        );

        let budget = ErrorBudget::new(config.daemon.error_budget_duration());
        let (state_tx, state_rx) = watch::channel(DaemonState::Idle);

        info!(
            lease_key = %config.lease_key,
            handlers = ?dispatcher.registry().kinds(),
            batch_size = config.reader.batch_size,
            "Cursor daemon created"
        );

        Ok(Self {
            config,
            role,
            lease,
            log,
            dispatcher,
            gaps,
            gaps_restored: false,
            reader,
            budget,
            clock: collaborators.clock,
            state_tx,
            state_rx,
            shutdown,
            signal,
            exit: None,
            iterations: 0,
            last_bookmark: None,
        })
    }

    /// Handle that stops the daemon when triggered.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Get current daemon state.
    pub fn state(&self) -> DaemonState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<DaemonState> {
        self.state_rx.clone()
    }

    /// Why the daemon will stop (or has stopped), if it has been asked to.
    pub fn exit_requested(&self) -> Option<ExitReason> {
        self.exit
            .or_else(|| self.signal.is_triggered().then_some(ExitReason::Signal))
    }

    /// Snapshot for health endpoints. Performs no I/O.
    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            state: self.state(),
            bookmark: self.last_bookmark,
            outstanding_gaps: self.gaps.outstanding(),
            iterations: self.iterations,
            failing_for: self.budget.failing_for(Instant::now()),
            consecutive_failures: self.budget.consecutive_failures(),
            exit: self.exit_requested(),
        }
    }

    fn set_state(&self, state: DaemonState) {
        self.state_tx.send_replace(state);
        metrics::set_daemon_state(&state.to_string());
    }

    /// Run until a signal arrives or the error budget is exhausted.
    pub async fn run(&mut self) -> ExitReason {
        let span = info_span!("replication_cursor", lease_key = %self.config.lease_key);
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> ExitReason {
        info!(
            error_budget_secs = self.budget.max().as_secs(),
            lease_ttl_ms = self.config.daemon.lease_ttl_duration().as_millis() as u64,
            "Cursor daemon running"
        );

        let reason = loop {
            if let Some(reason) = self.exit_requested() {
                break reason;
            }
            let outcome = self.run_once().await;
            debug!(iteration = self.iterations, outcome = ?outcome, "Iteration finished");
        };

        self.set_state(DaemonState::Exiting);
        if self.gaps.has_unflushed() {
            self.gaps.flush().await;
        }

        match reason {
            ExitReason::Signal => info!(
                iterations = self.iterations,
                bookmark = ?self.last_bookmark,
                "Cursor daemon stopped"
            ),
            ExitReason::ErrorBudgetExhausted => error!(
                iterations = self.iterations,
                bookmark = ?self.last_bookmark,
                "Cursor daemon stopped: error budget exhausted"
            ),
        }
        reason
    }

    /// One pass of the control loop, including the trailing sleep.
    pub async fn run_once(&mut self) -> IterationOutcome {
        self.iterations += 1;

        self.set_state(DaemonState::CheckingRole);
        let follower = match self.role.is_follower().await {
            Ok(follower) => follower,
            Err(e) if e.is_shutdown() => return IterationOutcome::Interrupted,
            Err(e) => {
                warn!(error = %e, "Role check failed, treating node as not eligible");
                false
            }
        };

        if !follower {
            self.set_state(DaemonState::NotEligible);
            debug!("Not a replication follower, skipping");
            self.sleep(self.config.daemon.role_check_interval_duration()).await;
            self.set_state(DaemonState::Idle);
            return IterationOutcome::NotEligible;
        }

        let outcome = match self.find_and_handle_events().await {
            Ok(report) => {
                self.budget.record_success(Instant::now());
                IterationOutcome::Completed(report)
            }
            Err(e) if e.is_shutdown() => {
                debug!("Iteration interrupted by shutdown");
                IterationOutcome::Interrupted
            }
            Err(e) => self.record_failure(e),
        };

        if self.exit_requested().is_none() {
            let ttl = self.config.daemon.lease_ttl_duration();
            let jitter = self.config.daemon.max_jitter_duration();
            self.sleep(sleep_duration(ttl, jitter)).await;
        }
        if self.exit_requested().is_none() {
            self.set_state(DaemonState::Idle);
        }
        outcome
    }

    fn record_failure(&mut self, error: CursorError) -> IterationOutcome {
        metrics::record_iteration_failure(error_label(&error));

        if !error.counts_against_budget() {
            warn!(error = %error, "Iteration failed");
            return IterationOutcome::Failed { error, budget: None };
        }

        let status = self.budget.record_failure(Instant::now());
        match status {
            BudgetStatus::Exhausted { failing_for, failures } => {
                error!(
                    error = %error,
                    failures,
                    failing_for_secs = failing_for.as_secs(),
                    error_budget_secs = self.budget.max().as_secs(),
                    "FATAL: replication cursor has been failing longer than its error budget, stopping"
                );
                self.exit = Some(ExitReason::ErrorBudgetExhausted);
            }
            BudgetStatus::WithinBudget { failing_for, failures } => {
                warn!(
                    error = %error,
                    retryable = error.is_retryable(),
                    failures,
                    failing_for_secs = failing_for.as_secs(),
                    "Iteration failed, will retry"
                );
            }
        }
        IterationOutcome::Failed {
            error,
            budget: Some(status),
        }
    }

    /// Acquire the lease (best effort), backfill gaps, then read new entries.
    pub async fn find_and_handle_events(&mut self) -> Result<EventsReport> {
        if !self.gaps_restored {
            self.gaps.restore().await?;
            self.gaps_restored = true;
        }

        self.set_state(DaemonState::Leasing);
        let lease_granted = self.acquire_lease().await?;

        self.set_state(DaemonState::Fetching);
        let gaps = metrics::timed(
            "fill_gaps",
            self.gaps
                .fill_gaps(self.log.as_ref(), &self.dispatcher, self.clock.now()),
        )
        .await?;

        let mut sink = DispatchSink {
            gaps: &mut self.gaps,
            dispatcher: &self.dispatcher,
            clock: self.clock.as_ref(),
            state_tx: &self.state_tx,
        };
        let read = metrics::timed("fetch_in_batches", self.reader.fetch_in_batches(&mut sink)).await?;
        self.last_bookmark = Some(read.last_id);

        Ok(EventsReport {
            lease_granted,
            gaps,
            read,
        })
    }

    async fn acquire_lease(&self) -> Result<bool> {
        let key = &self.config.lease_key;
        let ttl = self.config.daemon.lease_ttl_duration();

        let grant = match self.lease.try_acquire(key, ttl).await {
            Ok(grant) => grant,
            Err(e) if e.is_shutdown() => return Err(e),
            Err(e) => {
                warn!(lease_key = %key, error = %e, "Lease acquisition failed, proceeding without lease");
                metrics::record_lease_acquire("error");
                return Ok(false);
            }
        };

        if grant.granted {
            debug!(lease_key = %key, ttl_ms = grant.ttl.as_millis() as u64, "Lease acquired");
            metrics::record_lease_acquire("granted");
        } else if let Some(error) = &grant.error {
            warn!(lease_key = %key, error = %error, "Lease service error, proceeding without lease");
            metrics::record_lease_acquire("error");
        } else {
            info!(lease_key = %key, "Lease held elsewhere, proceeding without lease");
            metrics::record_lease_acquire("denied");
        }
        Ok(grant.granted)
    }

    async fn sleep(&mut self, duration: Duration) {
        self.set_state(DaemonState::Sleeping);
        if !self.signal.sleep(duration).await {
            debug!("Sleep interrupted by shutdown");
        }
    }
}

fn error_label(error: &CursorError) -> &'static str {
    match error {
        CursorError::Store(_) => "store",
        CursorError::LogStore { .. } => "log_store",
        CursorError::Collaborator { .. } => "collaborator",
        CursorError::Timeout { .. } => "timeout",
        CursorError::UnknownHandler { .. } => "unknown_handler",
        CursorError::Handler { .. } => "handler",
        CursorError::Config(_) => "config",
        CursorError::Shutdown => "shutdown",
        CursorError::Internal(_) => "internal",
    }
}

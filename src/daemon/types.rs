// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Daemon state types.
//!
//! # State Transitions
//!
//! ```text
//!            run_once()
//! Idle ───────────────→ CheckingRole
//!  ↑                        │
//!  │        (not follower)  │  (follower)
//!  │     NotEligible ←──────┴──────→ Leasing
//!  │          │                        │
//!  │          │                        ↓
//!  │          │                    Fetching ⇄ Processing
//!  │          ↓                        │
//!  └────── Sleeping ←──────────────────┘
//!
//! any state ──(signal / error budget exhausted)──→ Exiting
//! ```

use crate::budget::BudgetStatus;
use crate::error::CursorError;
use crate::gaps::FillSummary;
use crate::reader::ReadSummary;
use std::time::Duration;

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Between iterations, or not started yet.
    Idle,
    CheckingRole,
    /// This node is not a follower; waiting for `role_check_interval`.
    NotEligible,
    /// Contending for the lease.
    Leasing,
    /// Backfilling gaps or querying the log.
    Fetching,
    /// Dispatching a batch.
    Processing,
    Sleeping,
    /// Terminal. `run()` is returning.
    Exiting,
}

impl DaemonState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exiting)
    }
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DaemonState::Idle => "Idle",
            DaemonState::CheckingRole => "CheckingRole",
            DaemonState::NotEligible => "NotEligible",
            DaemonState::Leasing => "Leasing",
            DaemonState::Fetching => "Fetching",
            DaemonState::Processing => "Processing",
            DaemonState::Sleeping => "Sleeping",
            DaemonState::Exiting => "Exiting",
        };
        f.write_str(name)
    }
}

/// Why [`run()`](super::CursorDaemon::run) returned.
///
/// A supervisor can restart on `ErrorBudgetExhausted` with its own backoff;
/// `Signal` means someone asked us to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Signal,
    ErrorBudgetExhausted,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Signal => write!(f, "signal"),
            ExitReason::ErrorBudgetExhausted => write!(f, "error budget exhausted"),
        }
    }
}

/// What one `find_and_handle_events()` pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventsReport {
    pub lease_granted: bool,
    pub gaps: FillSummary,
    pub read: ReadSummary,
}

/// Result of a single `run_once()`.
#[derive(Debug)]
pub enum IterationOutcome {
    /// Not a follower (or the role check failed); nothing was read.
    NotEligible,
    Completed(EventsReport),
    /// The pass failed; `budget` is the error budget after recording it.
    Failed {
        error: CursorError,
        budget: Option<BudgetStatus>,
    },
    /// Shutdown was requested mid-iteration.
    Interrupted,
}

impl IterationOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Point-in-time view of the daemon, for health endpoints and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonStatus {
    pub state: DaemonState,
    /// Bookmark as of the last completed read pass.
    pub bookmark: Option<i64>,
    pub outstanding_gaps: usize,
    pub iterations: u64,
    /// How long iterations have been failing, `None` when healthy.
    pub failing_for: Option<Duration>,
    pub consecutive_failures: u32,
    pub exit: Option<ExitReason>,
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Elapsed-time error budget.
//!
//! Counting failures says little when iterations are seconds apart one day
//! and minutes apart the next. The budget instead measures how long the
//! daemon has been failing without a single successful iteration:
//!
//! ```text
//! t=0    fail  → timer starts
//! t=30s  fail  → failing for 30s
//! t=60s  ok    → timer reset
//! t=90s  fail  → timer starts again
//! ...
//! failing for > error_budget → Exhausted, daemon stops
//! ```

use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Result of feeding a failure into the budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    WithinBudget { failing_for: Duration, failures: u32 },
    Exhausted { failing_for: Duration, failures: u32 },
}

impl BudgetStatus {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Tracks how long the daemon has been continuously failing.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    max: Duration,
    first_failure_at: Option<Instant>,
    consecutive_failures: u32,
}

impl ErrorBudget {
    pub fn new(max: Duration) -> Self {
        Self {
            max,
            first_failure_at: None,
            consecutive_failures: 0,
        }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Reset after a successful iteration.
    pub fn record_success(&mut self, now: Instant) {
        if let Some(started) = self.first_failure_at.take() {
            info!(
                failures = self.consecutive_failures,
                failing_for_ms = now.saturating_duration_since(started).as_millis() as u64,
                "Recovered, error budget reset"
            );
        }
        self.consecutive_failures = 0;
    }

    /// Record a failed iteration at `now`.
    ///
    /// Exhausted only once the time since the first unresolved failure
    /// strictly exceeds the maximum.
    pub fn record_failure(&mut self, now: Instant) -> BudgetStatus {
        let started = *self.first_failure_at.get_or_insert(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let failing_for = now.saturating_duration_since(started);
        if failing_for > self.max {
            BudgetStatus::Exhausted {
                failing_for,
                failures: self.consecutive_failures,
            }
        } else {
            BudgetStatus::WithinBudget {
                failing_for,
                failures: self.consecutive_failures,
            }
        }
    }

    /// How long the daemon has been failing, `None` when healthy.
    pub fn failing_for(&self, now: Instant) -> Option<Duration> {
        self.first_failure_at
            .map(|started| now.saturating_duration_since(started))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

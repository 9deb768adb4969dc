// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wall-clock source for gap timestamps.
//!
//! Gap ages are measured in wall-clock time so they survive restarts.
//! Production uses [`SystemClock`]; tests inject
//! [`ManualClock`](crate::memory::ManualClock) to age gaps deterministically.

use chrono::{DateTime, Utc};

/// Source of "now" for gap detection and retry-window expiry.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

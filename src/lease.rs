// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Advisory lease between cursor instances.
//!
//! The lease reduces, but does not prevent, two instances advancing the
//! same bookmark at once. Handlers must tolerate at-least-once delivery
//! regardless.

use crate::error::BoxFuture;
use std::time::Duration;

/// Outcome of a lease acquisition attempt.
///
/// Acquisition never fails outright: service errors are carried in
/// `error` and the cursor carries on without the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseGrant {
    pub granted: bool,
    /// TTL the lease service actually granted (or would have).
    pub ttl: Duration,
    pub error: Option<String>,
}

impl LeaseGrant {
    pub fn granted(ttl: Duration) -> Self {
        Self {
            granted: true,
            ttl,
            error: None,
        }
    }

    /// Lease is held by someone else.
    pub fn denied(ttl: Duration) -> Self {
        Self {
            granted: false,
            ttl,
            error: None,
        }
    }

    /// The lease service could not be reached or answered with an error.
    pub fn failed(ttl: Duration, error: impl Into<String>) -> Self {
        Self {
            granted: false,
            ttl,
            error: Some(error.into()),
        }
    }
}

/// Time-boxed advisory lock service.
pub trait Lease: Send + Sync {
    /// Try to take the lease for `ttl`. Non-blocking; always returns a grant.
    fn try_acquire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, LeaseGrant>;

    /// Extend a held lease. `false` means it was lost.
    fn renew(&self, key: &str) -> BoxFuture<'_, bool>;
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication cursor.
//!
//! Errors are categorized by where they come from (the event log, the local
//! SQLite store, a handler, ...) and carry enough context to tell which
//! operation failed.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Counts against budget | Description |
//! |------------|-----------|-----------------------|-------------|
//! | `LogStore` | Yes | Yes | Event log query failed |
//! | `Collaborator` | Yes | Yes | Lease/role/scope service failed |
//! | `Timeout` | Yes | Yes | A collaborator call exceeded `call_timeout` |
//! | `Handler` | Yes | Yes | A registered handler failed to process an event |
//! | `Store` | No | Yes | Local SQLite errors (needs operator attention) |
//! | `UnknownHandler` | No | Yes | No handler registered for a payload kind |
//! | `Config` | No | No | Configuration invalid |
//! | `Shutdown` | No | No | Daemon is shutting down |
//! | `Internal` | No | Yes | Unexpected internal error |
//!
//! # Error Budget
//!
//! Every error escaping a cursor iteration feeds the daemon's elapsed-time
//! error budget, except [`CursorError::Shutdown`]: being interrupted is not
//! a failure.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cursor operations.
pub type Result<T> = std::result::Result<T, CursorError>;

/// Boxed future returned by collaborator traits.
///
/// Keeps the collaborator traits object-safe so the daemon can hold them as
/// `Arc<dyn Trait>`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while tailing and replaying the event log.
#[derive(Error, Debug)]
pub enum CursorError {
    /// SQLite error in the bookmark/gap store.
    #[error("Cursor store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Event log query failure.
    ///
    /// The primary's log is usually reached over the network, so these are
    /// retryable on the next iteration.
    #[error("Event log error ({operation}): {message}")]
    LogStore { operation: String, message: String },

    /// Failure of another external collaborator (lease, role, scope checks).
    #[error("Collaborator error ({operation}): {message}")]
    Collaborator { operation: String, message: String },

    /// A collaborator call did not complete within the configured deadline.
    #[error("Timed out after {after:?} waiting for {operation}")]
    Timeout { operation: String, after: Duration },

    /// No handler is registered for the payload kind.
    ///
    /// A programming/configuration error: the batch is aborted and the
    /// bookmark stays where it was.
    #[error("No handler registered for payload kind '{kind}'")]
    UnknownHandler { kind: String },

    /// A registered handler failed while processing an event.
    #[error("Handler for '{kind}' failed: {message}")]
    Handler { kind: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress; the current operation was interrupted.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CursorError {
    /// Create an event log error.
    pub fn log_store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LogStore {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a collaborator error.
    pub fn collaborator(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a handler error (used by handler implementations).
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Check if this error is retryable on a later iteration.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LogStore { .. } => true,
            Self::Collaborator { .. } => true,
            Self::Timeout { .. } => true,
            Self::Handler { .. } => true,
            Self::Store(_) => false, // Local DB issues need attention
            Self::UnknownHandler { .. } => false,
            Self::Config(_) => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Whether this error should be fed into the daemon's error budget.
    pub fn counts_against_budget(&self) -> bool {
        !matches!(self, Self::Shutdown | Self::Config(_))
    }

    /// Whether this error was caused by a shutdown request.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

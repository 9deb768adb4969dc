// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shutdown propagation and per-call deadlines.
//!
//! A single watch channel carries the shutdown request. The daemon loop
//! polls it between steps, sleeps race it, and every collaborator call goes
//! through a [`CallGuard`] that races the call against both the shutdown
//! channel and `call_timeout`.
//!
//! Handler invocations are never guarded: an event already being applied
//! runs to completion.

use crate::bookmark::BookmarkStore;
use crate::error::{BoxFuture, CursorError, Result};
use crate::gaps::{GapRecord, GapStore};
use crate::lease::{Lease, LeaseGrant};
use crate::log::{EventLog, EventLogEntry};
use crate::node::{NodeRole, ScopePolicy};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Create a connected shutdown handle/signal pair.
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx: Arc::new(tx) }, ShutdownSignal { rx })
}

/// Requests shutdown. Cheap to clone; safe to trigger more than once.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.tx.send_replace(true) {
            info!("Shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal { rx: self.tx.subscribe() }
    }
}

/// Observes shutdown requests.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested. Never resolves if every handle
    /// was dropped without triggering.
    pub async fn triggered(&mut self) {
        let observed = self.rx.wait_for(|requested| *requested).await.map(|_| ());
        if observed.is_err() {
            std::future::pending::<()>().await;
        }
    }

    /// Sleep for `duration`, returning early (`false`) on shutdown.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.triggered() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

/// Bounds collaborator calls by `call_timeout` and the shutdown channel.
#[derive(Clone, Debug)]
pub struct CallGuard {
    signal: ShutdownSignal,
    timeout: Duration,
}

impl CallGuard {
    pub fn new(signal: ShutdownSignal, timeout: Duration) -> Self {
        Self { signal, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `fut`, failing with `Shutdown` or `Timeout` if it does not finish first.
    pub async fn call<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut signal = self.signal.clone();
        if signal.is_triggered() {
            return Err(CursorError::Shutdown);
        }

        tokio::select! {
            biased;
            _ = signal.triggered() => {
                debug!(operation, "Call interrupted by shutdown");
                Err(CursorError::Shutdown)
            }
            result = self.deadline(operation, fut) => result,
        }
    }

    /// Run `fut` bounded only by the timeout.
    ///
    /// For writes that should land even while shutting down.
    pub async fn deadline<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, timeout_ms = self.timeout.as_millis() as u64, "Collaborator call timed out");
                Err(CursorError::Timeout {
                    operation: operation.to_string(),
                    after: self.timeout,
                })
            }
        }
    }
}

/// A collaborator whose every call goes through a [`CallGuard`].
pub struct Guarded<T: ?Sized> {
    inner: Arc<T>,
    guard: CallGuard,
}

impl<T: ?Sized> Guarded<T> {
    pub fn new(inner: Arc<T>, guard: CallGuard) -> Self {
        Self { inner, guard }
    }
}

impl EventLog for Guarded<dyn EventLog> {
    fn max_id(&self) -> BoxFuture<'_, Option<i64>> {
        Box::pin(self.guard.call("log_max_id", self.inner.max_id()))
    }

    fn query_after(&self, after: i64, limit: usize) -> BoxFuture<'_, Vec<EventLogEntry>> {
        Box::pin(self.guard.call("log_query_after", self.inner.query_after(after, limit)))
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Option<EventLogEntry>> {
        Box::pin(self.guard.call("log_get", self.inner.get(id)))
    }

    fn exists(&self, id: i64) -> BoxFuture<'_, bool> {
        Box::pin(self.guard.call("log_exists", self.inner.exists(id)))
    }
}

impl BookmarkStore for Guarded<dyn BookmarkStore> {
    fn get(&self) -> BoxFuture<'_, Option<i64>> {
        Box::pin(self.guard.call("bookmark_get", self.inner.get()))
    }

    fn set(&self, last_processed_id: i64) -> BoxFuture<'_, ()> {
        // The batch is already dispatched; record it even mid-shutdown.
        Box::pin(self.guard.deadline("bookmark_set", self.inner.set(last_processed_id)))
    }
}

impl GapStore for Guarded<dyn GapStore> {
    fn load_gaps(&self) -> BoxFuture<'_, Vec<GapRecord>> {
        Box::pin(self.guard.call("gaps_load", self.inner.load_gaps()))
    }

    // Writes also run on the way out, after shutdown was requested.
    fn save_gaps<'a>(&'a self, gaps: &'a [GapRecord]) -> BoxFuture<'a, ()> {
        Box::pin(self.guard.deadline("gaps_save", self.inner.save_gaps(gaps)))
    }

    fn remove_gaps<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, ()> {
        Box::pin(self.guard.deadline("gaps_remove", self.inner.remove_gaps(ids)))
    }
}

impl Lease for Guarded<dyn Lease> {
    fn try_acquire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, LeaseGrant> {
        let key = key.to_string();
        Box::pin(async move {
            match self.guard.call("lease_acquire", self.inner.try_acquire(&key, ttl)).await {
                Err(CursorError::Timeout { after, .. }) => {
                    Ok(LeaseGrant::failed(ttl, format!("lease service timed out after {after:?}")))
                }
                other => other,
            }
        })
    }

    fn renew(&self, key: &str) -> BoxFuture<'_, bool> {
        let key = key.to_string();
        Box::pin(async move { self.guard.call("lease_renew", self.inner.renew(&key)).await })
    }
}

impl NodeRole for Guarded<dyn NodeRole> {
    fn is_follower(&self) -> BoxFuture<'_, bool> {
        Box::pin(self.guard.call("role_check", self.inner.is_follower()))
    }
}

impl ScopePolicy for Guarded<dyn ScopePolicy> {
    fn scope_exists(&self, scope_id: i64) -> BoxFuture<'_, bool> {
        Box::pin(self.guard.call("scope_exists", self.inner.scope_exists(scope_id)))
    }

    fn scope_assigned_to_this_node(&self, scope_id: i64) -> BoxFuture<'_, bool> {
        Box::pin(self.guard.call(
            "scope_assigned",
            self.inner.scope_assigned_to_this_node(scope_id),
        ))
    }
}

/// Trigger `handle` on SIGTERM, SIGINT or SIGQUIT (Ctrl-C off unix).
///
/// Intended to be spawned next to the daemon:
///
/// ```rust,ignore
/// tokio::spawn(listen_for_signals(daemon.shutdown_handle()));
/// ```
pub async fn listen_for_signals(handle: ShutdownHandle) -> Result<()> {
    let name = wait_for_signal().await?;
    info!(signal = name, "Received signal, shutting down after the current step");
    handle.trigger();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let register = |kind: SignalKind, name: &str| {
        signal(kind).map_err(|e| CursorError::Internal(format!("failed to register {name}: {e}")))
    };
    let mut sigterm = register(SignalKind::terminate(), "SIGTERM")?;
    let mut sigint = register(SignalKind::interrupt(), "SIGINT")?;
    let mut sigquit = register(SignalKind::quit(), "SIGQUIT")?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| CursorError::Internal(format!("failed to listen for Ctrl-C: {e}")))?;
    Ok("Ctrl-C")
}

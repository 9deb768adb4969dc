//! Shared test utilities for scenario, property and chaos tests.
//!
//! This module provides:
//! - A recording handler registry (with per-record failure injection)
//! - Failure-injecting wrappers around the in-memory log and gap store
//! - A harness wiring a daemon to in-memory collaborators

#![allow(dead_code)]

use replication_cursor::memory::{LocalLease, ManualClock, MemoryEventLog, MemoryStateStore, StaticRole};
use replication_cursor::{
    BoxFuture, Collaborators, CursorConfig, CursorDaemon, CursorError, EventLog, EventLogEntry, GapRecord, GapStore,
    Handler, HandlerRegistry, Lease, LeaseGrant, Payload,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const KIND: &str = "RecordUpdate";

// =============================================================================
// Recording handlers
// =============================================================================

/// Records the `record_id` of every processed payload, in order.
#[derive(Clone, Default)]
pub struct Recorded {
    seen: Arc<Mutex<Vec<i64>>>,
    fail_on: Arc<Mutex<HashSet<i64>>>,
}

impl Recorded {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.seen.lock().unwrap().clear();
    }

    /// Make processing fail for `record_id` until [`heal`](Self::heal).
    pub fn fail_on(&self, record_id: i64) {
        self.fail_on.lock().unwrap().insert(record_id);
    }

    pub fn heal(&self) {
        self.fail_on.lock().unwrap().clear();
    }

    /// Registry with this recorder behind each of `kinds`.
    pub fn registry(&self, kinds: &[&str]) -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        for kind in kinds {
            let recorded = self.clone();
            registry.register(*kind, move |payload, _| RecordingHandler {
                payload,
                recorded: recorded.clone(),
            });
        }
        registry
    }
}

pub struct RecordingHandler {
    payload: Payload,
    recorded: Recorded,
}

impl Handler for RecordingHandler {
    fn process(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let id = self.payload.record_id;
            if self.recorded.fail_on.lock().unwrap().contains(&id) {
                return Err(CursorError::handler(self.payload.kind.clone(), format!("injected failure on {id}")));
            }
            self.recorded.seen.lock().unwrap().push(id);
            Ok(())
        })
    }
}

// =============================================================================
// Failure injection
// =============================================================================

/// Event log that fails every call while `failing` is set.
pub struct FlakyLog {
    pub inner: Arc<MemoryEventLog>,
    failing: AtomicBool,
    hanging: AtomicBool,
}

impl FlakyLog {
    pub fn new(inner: Arc<MemoryEventLog>) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Make every call hang forever (until cancelled).
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    fn check<'a, T: Send + 'a>(&'a self, operation: &'static str, ok: BoxFuture<'a, T>) -> BoxFuture<'a, T> {
        if self.hanging.load(Ordering::SeqCst) {
            return Box::pin(std::future::pending());
        }
        if self.failing.load(Ordering::SeqCst) {
            return Box::pin(async move { Err(CursorError::log_store(operation, "connection refused")) });
        }
        ok
    }
}

impl EventLog for FlakyLog {
    fn max_id(&self) -> BoxFuture<'_, Option<i64>> {
        self.check("max_id", self.inner.max_id())
    }

    fn query_after(&self, after: i64, limit: usize) -> BoxFuture<'_, Vec<EventLogEntry>> {
        self.check("query_after", self.inner.query_after(after, limit))
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Option<EventLogEntry>> {
        self.check("get", self.inner.get(id))
    }
}

/// Gap store whose writes always fail.
#[derive(Default)]
pub struct BrokenGapStore;

impl GapStore for BrokenGapStore {
    fn load_gaps(&self) -> BoxFuture<'_, Vec<GapRecord>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    fn save_gaps<'a>(&'a self, _gaps: &'a [GapRecord]) -> BoxFuture<'a, ()> {
        Box::pin(async { Err(CursorError::Internal("disk full".to_string())) })
    }

    fn remove_gaps<'a>(&'a self, _ids: &'a [i64]) -> BoxFuture<'a, ()> {
        Box::pin(async { Err(CursorError::Internal("disk full".to_string())) })
    }
}

/// Lease that grants every acquisition but whose renewals always error.
#[derive(Default)]
pub struct UnrenewableLease;

impl Lease for UnrenewableLease {
    fn try_acquire(&self, _key: &str, ttl: Duration) -> BoxFuture<'_, LeaseGrant> {
        Box::pin(async move { Ok(LeaseGrant::granted(ttl)) })
    }

    fn renew(&self, _key: &str) -> BoxFuture<'_, bool> {
        Box::pin(async { Err(CursorError::collaborator("lease_renew", "lease service unavailable")) })
    }
}

// =============================================================================
// Harness
// =============================================================================

/// A daemon over in-memory collaborators, with handles to all of them.
pub struct Harness {
    pub log: Arc<MemoryEventLog>,
    pub flaky: Arc<FlakyLog>,
    pub store: Arc<MemoryStateStore>,
    pub role: Arc<StaticRole>,
    pub lease: Arc<LocalLease>,
    pub recorded: Recorded,
    /// Wall clock the daemon stamps and ages gaps with.
    pub clock: ManualClock,
    pub daemon: CursorDaemon,
}

pub struct HarnessBuilder {
    config: CursorConfig,
    store: Arc<MemoryStateStore>,
    log: Arc<MemoryEventLog>,
    lease: Arc<LocalLease>,
    lease_service: Option<Arc<dyn Lease>>,
    recorded: Recorded,
    gap_store: Option<Arc<dyn GapStore>>,
    scopes: Option<Arc<dyn replication_cursor::ScopePolicy>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: CursorConfig::for_testing(),
            store: Arc::new(MemoryStateStore::new()),
            log: Arc::new(MemoryEventLog::new()),
            lease: Arc::new(LocalLease::new()),
            lease_service: None,
            recorded: Recorded::new(),
            gap_store: None,
            scopes: None,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut CursorConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn bookmark(mut self, last_processed_id: i64) -> Self {
        self.store = Arc::new(MemoryStateStore::with_bookmark(last_processed_id));
        self
    }

    pub fn store(mut self, store: Arc<MemoryStateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn log(mut self, log: Arc<MemoryEventLog>) -> Self {
        self.log = log;
        self
    }

    pub fn lease(mut self, lease: LocalLease) -> Self {
        self.lease = Arc::new(lease);
        self
    }

    /// Use an arbitrary lease service instead of the local one.
    pub fn lease_service(mut self, lease: Arc<dyn Lease>) -> Self {
        self.lease_service = Some(lease);
        self
    }

    pub fn recorded(mut self, recorded: Recorded) -> Self {
        self.recorded = recorded;
        self
    }

    pub fn gap_store(mut self, store: Arc<dyn GapStore>) -> Self {
        self.gap_store = Some(store);
        self
    }

    pub fn scopes(mut self, scopes: Arc<dyn replication_cursor::ScopePolicy>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn build(self) -> Harness {
        let role = Arc::new(StaticRole::follower());
        let flaky = Arc::new(FlakyLog::new(self.log.clone()));
        let clock = ManualClock::starting_now();
        let lease = self
            .lease_service
            .unwrap_or_else(|| self.lease.clone() as Arc<dyn Lease>);

        let mut collaborators = Collaborators::new(
            role.clone(),
            lease,
            flaky.clone(),
            self.store.clone(),
            self.recorded.registry(&[KIND]),
        )
        .with_gap_store(
            self.gap_store
                .unwrap_or_else(|| self.store.clone() as Arc<dyn GapStore>),
        )
        .with_clock(Arc::new(clock.clone()));
        if let Some(scopes) = self.scopes {
            collaborators = collaborators.with_scope_policy(scopes);
        }

        let daemon = CursorDaemon::new(self.config, collaborators).expect("valid test config");
        Harness {
            log: self.log,
            flaky,
            store: self.store,
            role,
            lease: self.lease,
            recorded: self.recorded,
            clock,
            daemon,
        }
    }
}

/// Insert entries of the default kind at the given ids.
pub fn publish(log: &MemoryEventLog, ids: &[i64]) {
    for id in ids {
        log.insert_entry(MemoryEventLog::entry(*id, KIND, None));
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process collaborators.
//!
//! Enough to run the cursor standalone (single node, local log) and to
//! drive it from tests. None of these survive a restart.

use crate::bookmark::BookmarkStore;
use crate::clock::Clock;
use crate::error::{BoxFuture, Result};
use crate::gaps::{GapRecord, GapStore};
use crate::lease::{Lease, LeaseGrant};
use crate::log::{EventLog, EventLogEntry, Payload};
use crate::node::{NodeRole, ScopePolicy};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// Lock, recovering from poisoning (every critical section here is a
/// single map operation, so the data is never left half-updated).
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event log
// ═══════════════════════════════════════════════════════════════════════════════

/// Event log held in a `BTreeMap`.
///
/// [`append`](Self::append) assigns the next id; [`insert_entry`](Self::insert_entry)
/// places an entry at an arbitrary id, which is how out-of-order visibility
/// is simulated.
#[derive(Default)]
pub struct MemoryEventLog {
    entries: Mutex<BTreeMap<i64, EventLogEntry>>,
    next_id: AtomicU64,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an entry with a small JSON body.
    pub fn entry(id: i64, kind: &str, scope_id: Option<i64>) -> EventLogEntry {
        EventLogEntry {
            id,
            created_at: Utc::now(),
            scope_id,
            payload: Some(Payload {
                kind: kind.to_string(),
                record_id: id,
                body: serde_json::json!({ "id": id }),
            }),
        }
    }

    /// Append an entry with the next id. Returns the id.
    pub fn append(&self, kind: &str, scope_id: Option<i64>) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        self.insert_entry(Self::entry(id, kind, scope_id));
        id
    }

    /// Insert (or replace) an entry at its own id.
    pub fn insert_entry(&self, entry: EventLogEntry) {
        self.next_id.fetch_max(entry.id.max(0) as u64, Ordering::SeqCst);
        lock(&self.entries).insert(entry.id, entry);
    }

    /// Reserve the next `count` ids without making them visible.
    ///
    /// Returns the reserved ids; publish them later with `insert_entry`.
    pub fn reserve(&self, count: usize) -> Vec<i64> {
        (0..count)
            .map(|_| self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1)
            .collect()
    }

    pub fn remove(&self, id: i64) -> Option<EventLogEntry> {
        lock(&self.entries).remove(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

impl EventLog for MemoryEventLog {
    fn max_id(&self) -> BoxFuture<'_, Option<i64>> {
        let max = lock(&self.entries).keys().next_back().copied();
        Box::pin(async move { Ok(max) })
    }

    fn query_after(&self, after: i64, limit: usize) -> BoxFuture<'_, Vec<EventLogEntry>> {
        let batch: Vec<EventLogEntry> = lock(&self.entries)
            .range(after.saturating_add(1)..)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect();
        Box::pin(async move { Ok(batch) })
    }

    fn get(&self, id: i64) -> BoxFuture<'_, Option<EventLogEntry>> {
        let entry = lock(&self.entries).get(&id).cloned();
        Box::pin(async move { Ok(entry) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bookmark and gap state
// ═══════════════════════════════════════════════════════════════════════════════

/// Bookmark and gaps kept in memory.
#[derive(Default)]
pub struct MemoryStateStore {
    bookmark: Mutex<Option<i64>>,
    gaps: Mutex<BTreeMap<i64, GapRecord>>,
    bookmark_writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a bookmark already in place.
    pub fn with_bookmark(last_processed_id: i64) -> Self {
        let store = Self::default();
        *lock(&store.bookmark) = Some(last_processed_id);
        store
    }

    pub fn bookmark(&self) -> Option<i64> {
        *lock(&self.bookmark)
    }

    /// Number of `set` calls that moved or rewrote the bookmark.
    pub fn bookmark_writes(&self) -> usize {
        self.bookmark_writes.load(Ordering::SeqCst)
    }

    pub fn gap_ids(&self) -> Vec<i64> {
        lock(&self.gaps).keys().copied().collect()
    }
}

impl BookmarkStore for MemoryStateStore {
    fn get(&self) -> BoxFuture<'_, Option<i64>> {
        let bookmark = self.bookmark();
        Box::pin(async move { Ok(bookmark) })
    }

    fn set(&self, last_processed_id: i64) -> BoxFuture<'_, ()> {
        {
            let mut bookmark = lock(&self.bookmark);
            if bookmark.map_or(true, |current| last_processed_id >= current) {
                *bookmark = Some(last_processed_id);
                self.bookmark_writes.fetch_add(1, Ordering::SeqCst);
            }
        }
        Box::pin(async { Ok(()) })
    }
}

impl GapStore for MemoryStateStore {
    fn load_gaps(&self) -> BoxFuture<'_, Vec<GapRecord>> {
        let records: Vec<GapRecord> = lock(&self.gaps).values().copied().collect();
        Box::pin(async move { Ok(records) })
    }

    fn save_gaps<'a>(&'a self, gaps: &'a [GapRecord]) -> BoxFuture<'a, ()> {
        {
            let mut stored = lock(&self.gaps);
            for gap in gaps {
                stored.entry(gap.id).or_insert(*gap);
            }
        }
        Box::pin(async { Ok(()) })
    }

    fn remove_gaps<'a>(&'a self, ids: &'a [i64]) -> BoxFuture<'a, ()> {
        {
            let mut stored = lock(&self.gaps);
            for id in ids {
                stored.remove(id);
            }
        }
        Box::pin(async { Ok(()) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Node role and scopes
// ═══════════════════════════════════════════════════════════════════════════════

/// Fixed (but switchable) replication role.
#[derive(Debug)]
pub struct StaticRole {
    follower: AtomicBool,
}

impl StaticRole {
    pub fn follower() -> Self {
        Self {
            follower: AtomicBool::new(true),
        }
    }

    pub fn primary() -> Self {
        Self {
            follower: AtomicBool::new(false),
        }
    }

    /// Simulate a failover.
    pub fn set_follower(&self, follower: bool) {
        self.follower.store(follower, Ordering::SeqCst);
    }
}

impl NodeRole for StaticRole {
    fn is_follower(&self) -> BoxFuture<'_, bool> {
        let follower = self.follower.load(Ordering::SeqCst);
        Box::pin(async move { Ok(follower) })
    }
}

/// Scope table: scope id → assigned to this node.
#[derive(Default)]
pub struct MemoryScopes {
    scopes: Mutex<HashMap<i64, bool>>,
}

impl MemoryScopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scope(&self, scope_id: i64, assigned_here: bool) {
        lock(&self.scopes).insert(scope_id, assigned_here);
    }

    pub fn remove_scope(&self, scope_id: i64) {
        lock(&self.scopes).remove(&scope_id);
    }
}

impl ScopePolicy for MemoryScopes {
    fn scope_exists(&self, scope_id: i64) -> BoxFuture<'_, bool> {
        let exists = lock(&self.scopes).contains_key(&scope_id);
        Box::pin(async move { Ok(exists) })
    }

    fn scope_assigned_to_this_node(&self, scope_id: i64) -> BoxFuture<'_, bool> {
        let assigned = lock(&self.scopes).get(&scope_id).copied().unwrap_or(false);
        Box::pin(async move { Ok(assigned) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lease
// ═══════════════════════════════════════════════════════════════════════════════

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
struct Held {
    holder: u64,
    ttl: Duration,
    expires_at: Instant,
}

/// TTL lease over a process-local table.
///
/// Each `LocalLease` is one contender; [`contender`](Self::contender)
/// creates another one sharing the same table.
pub struct LocalLease {
    holder: u64,
    table: Arc<Mutex<HashMap<String, Held>>>,
}

impl Default for LocalLease {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalLease {
    pub fn new() -> Self {
        Self {
            holder: NEXT_HOLDER.fetch_add(1, Ordering::Relaxed),
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Another contender for the same leases.
    pub fn contender(&self) -> Self {
        Self {
            holder: NEXT_HOLDER.fetch_add(1, Ordering::Relaxed),
            table: self.table.clone(),
        }
    }

    /// Whether this contender currently holds `key`.
    pub fn is_held(&self, key: &str) -> bool {
        let now = Instant::now();
        lock(&self.table)
            .get(key)
            .is_some_and(|held| held.holder == self.holder && held.expires_at > now)
    }

    /// Drop `key` regardless of who holds it.
    pub fn release(&self, key: &str) {
        lock(&self.table).remove(key);
    }
}

/// `now + ttl`, clamped for absurdly long TTLs.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

impl Lease for LocalLease {
    fn try_acquire(&self, key: &str, ttl: Duration) -> BoxFuture<'_, LeaseGrant> {
        let now = Instant::now();
        let grant = {
            let mut table = lock(&self.table);
            match table.get(key) {
                Some(held) if held.holder != self.holder && held.expires_at > now => LeaseGrant::denied(ttl),
                _ => {
                    table.insert(
                        key.to_string(),
                        Held {
                            holder: self.holder,
                            ttl,
                            expires_at: expiry(now, ttl),
                        },
                    );
                    LeaseGrant::granted(ttl)
                }
            }
        };
        Box::pin(async move { Ok(grant) })
    }

    fn renew(&self, key: &str) -> BoxFuture<'_, bool> {
        let now = Instant::now();
        let renewed = match lock(&self.table).get_mut(key) {
            Some(held) if held.holder == self.holder && held.expires_at > now => {
                held.expires_at = expiry(now, held.ttl);
                true
            }
            _ => false,
        };
        Box::pin(async move { Ok(renewed) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Clock
// ═══════════════════════════════════════════════════════════════════════════════

/// Wall clock that only moves when told to. Clones share the same time.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Start at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        let mut now = lock(&self.now);
        *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

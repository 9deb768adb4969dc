// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The primary's event log, as seen by the cursor.
//!
//! The cursor only ever reads the log. Entries are ordered by `id`, which
//! the log store assigns monotonically; gaps in the sequence are possible
//! (rolled-back transactions, rows not yet visible).

use crate::error::BoxFuture;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The typed mutation record an entry points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Declared type, used to pick a handler (e.g. `"AccountUpdate"`).
    pub kind: String,
    /// Id of the mutation record in the primary's store.
    pub record_id: i64,
    /// Record contents, opaque to the cursor.
    #[serde(default)]
    pub body: serde_json::Value,
}

/// One row of the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    /// Owning scope (e.g. the entity the change belongs to). `None` for
    /// global events.
    pub scope_id: Option<i64>,
    /// `None` when the referenced record no longer resolves, typically
    /// because its subject was deleted and garbage-collected.
    pub payload: Option<Payload>,
}

impl EventLogEntry {
    /// Payload kind, if the payload still resolves.
    pub fn kind(&self) -> Option<&str> {
        self.payload.as_ref().map(|p| p.kind.as_str())
    }
}

/// Read access to the event log.
///
/// Implementations must return `query_after` results ordered by ascending id.
pub trait EventLog: Send + Sync {
    /// Current maximum id in the log, `None` if the log is empty.
    fn max_id(&self) -> BoxFuture<'_, Option<i64>>;

    /// Up to `limit` entries with `id > after`, ascending.
    fn query_after(&self, after: i64, limit: usize) -> BoxFuture<'_, Vec<EventLogEntry>>;

    /// Fetch a single entry by id.
    fn get(&self, id: i64) -> BoxFuture<'_, Option<EventLogEntry>>;

    /// Whether an entry with this id is currently visible.
    fn exists(&self, id: i64) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.get(id).await?.is_some()) })
    }
}

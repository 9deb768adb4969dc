// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event dispatch: from a log entry to a handler invocation.
//!
//! Handlers are registered up front by payload kind. Each entry goes
//! through the same decision list, whether it came from a normal batch or
//! from gap backfill:
//!
//! ```text
//! payload unresolved?           → skip (SkippedUnresolved)
//! scope set and policy present:
//!     scope gone?               → replay (deletion must propagate)
//!     scope not assigned here?  → skip (SkippedOutOfShard)
//! kind registered?              → build handler, process() (Processed)
//! otherwise                     → UnknownHandler error (aborts the batch)
//! ```

use crate::error::{BoxFuture, CursorError, Result};
use crate::log::{EventLogEntry, Payload};
use crate::metrics;
use crate::node::ScopePolicy;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Applies one event's effect locally.
///
/// Handlers must be idempotent: delivery is at-least-once.
pub trait Handler: Send {
    fn process(&mut self) -> BoxFuture<'_, ()>;
}

type HandlerFactory = Box<dyn Fn(Payload, DateTime<Utc>) -> Box<dyn Handler> + Send + Sync>;

/// Payload kind → handler factory.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for `kind`. A second registration replaces the first.
    pub fn register<F, H>(&mut self, kind: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Payload, DateTime<Utc>) -> H + Send + Sync + 'static,
        H: Handler + 'static,
    {
        let kind = kind.into();
        let boxed: HandlerFactory =
            Box::new(move |payload: Payload, created_at: DateTime<Utc>| -> Box<dyn Handler> {
                Box::new(factory(payload, created_at))
            });
        if self.factories.insert(kind.clone(), boxed).is_some() {
            warn!(kind = %kind, "Handler re-registered, replacing previous factory");
        }
        self
    }

    /// Build the handler for `payload`, if its kind is registered.
    pub fn resolve(&self, payload: &Payload, created_at: DateTime<Utc>) -> Option<Box<dyn Handler>> {
        self.factories
            .get(&payload.kind)
            .map(|factory| factory(payload.clone(), created_at))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// What happened to a dispatched entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Processed,
    /// The payload no longer resolves (subject deleted).
    SkippedUnresolved,
    /// The scope belongs to another shard.
    SkippedOutOfShard,
}

impl DispatchOutcome {
    pub fn is_skip(&self) -> bool {
        !matches!(self, Self::Processed)
    }
}

/// Anything that can take a single log entry through dispatch.
pub trait EntryHandler: Send + Sync {
    fn handle<'a>(&'a self, entry: &'a EventLogEntry) -> BoxFuture<'a, DispatchOutcome>;
}

/// Routes entries to registered handlers, applying the skip policy.
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    scopes: Option<Arc<dyn ScopePolicy>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry, scopes: None }
    }

    /// Enable scope existence and shard checks.
    pub fn with_scope_policy(mut self, scopes: Arc<dyn ScopePolicy>) -> Self {
        self.scopes = Some(scopes);
        self
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Dispatch one entry.
    pub async fn handle_single(&self, entry: &EventLogEntry) -> Result<DispatchOutcome> {
        let Some(payload) = entry.payload.as_ref() else {
            info!(id = entry.id, scope_id = ?entry.scope_id, "Skipping entry whose payload no longer resolves");
            metrics::record_event_skipped("unresolved");
            return Ok(DispatchOutcome::SkippedUnresolved);
        };

        if let (Some(scope_id), Some(scopes)) = (entry.scope_id, self.scopes.as_ref()) {
            if !scopes.scope_exists(scope_id).await? {
                debug!(id = entry.id, scope_id, "Scope no longer exists, replaying so the deletion propagates");
            } else if !scopes.scope_assigned_to_this_node(scope_id).await? {
                debug!(id = entry.id, scope_id, kind = %payload.kind, "Scope not assigned to this node, skipping");
                metrics::record_event_skipped("out_of_shard");
                return Ok(DispatchOutcome::SkippedOutOfShard);
            }
        }

        let Some(mut handler) = self.registry.resolve(payload, entry.created_at) else {
            error!(
                id = entry.id,
                kind = %payload.kind,
                registered = ?self.registry.kinds(),
                "No handler registered for payload kind"
            );
            return Err(CursorError::UnknownHandler {
                kind: payload.kind.clone(),
            });
        };

        handler.process().await?;
        debug!(id = entry.id, kind = %payload.kind, "Dispatched entry");
        metrics::record_event_dispatched(&payload.kind);
        Ok(DispatchOutcome::Processed)
    }
}

impl EntryHandler for Dispatcher {
    fn handle<'a>(&'a self, entry: &'a EventLogEntry) -> BoxFuture<'a, DispatchOutcome> {
        Box::pin(self.handle_single(entry))
    }
}

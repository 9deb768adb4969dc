// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! What this node is: its replication role and the scopes it owns.

use crate::error::BoxFuture;

/// Replication role of the local node.
pub trait NodeRole: Send + Sync {
    /// `true` when this node is currently a replication follower.
    fn is_follower(&self) -> BoxFuture<'_, bool>;
}

/// Scope existence and shard assignment checks.
///
/// Only configured on nodes that replicate a subset of scopes.
pub trait ScopePolicy: Send + Sync {
    /// Whether the scope still exists locally.
    fn scope_exists(&self, scope_id: i64) -> BoxFuture<'_, bool>;

    /// Whether the scope is assigned to this node's shard.
    fn scope_assigned_to_this_node(&self, scope_id: i64) -> BoxFuture<'_, bool>;
}

//! Capability interfaces the engine needs from its host.
//!
//! The permission backend owns groups, users and their nodes; the session
//! directory knows which users are currently resident and what they are
//! called. Both are implemented by the host. `MemoryBackend` implements both
//! in-process.

mod memory;

use std::fmt;
use std::future::Future;

use crate::engine::TopologyListener;
use crate::error::Result;
use crate::types::{PermissionNode, UserId};

pub use memory::MemoryBackend;

/// Read-only view of a group and its own nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupView {
    pub name: String,
    pub nodes: Vec<PermissionNode>,
}

impl GroupView {
    pub fn new(name: impl Into<String>, nodes: Vec<PermissionNode>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }
}

/// Read-only view of a user as the backend currently sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserView {
    pub id: UserId,
    pub username: Option<String>,
    pub primary_group: String,
    /// The user's own nodes. Never an input to quota computation.
    pub nodes: Vec<PermissionNode>,
}

/// A single atomic change to a user's own node set: every node whose key is
/// in `remove` is dropped, then `add` is inserted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeMutation {
    pub remove: Vec<String>,
    pub add: Vec<PermissionNode>,
}

impl NodeMutation {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }

    /// Apply to a node list in place (removals first).
    pub fn apply_to(&self, nodes: &mut Vec<PermissionNode>) {
        nodes.retain(|node| !self.remove.iter().any(|key| key == node.key()));
        for node in &self.add {
            if !nodes.contains(node) {
                nodes.push(node.clone());
            }
        }
    }
}

/// Permission store capability.
///
/// Async methods may suspend on backend I/O. Implementations must apply a
/// `NodeMutation` as one unit: other readers see either the old or the new
/// node set.
pub trait PermissionBackend: Send + Sync + 'static {
    /// Whether the backend is present and loaded.
    fn is_available(&self) -> bool;

    /// Fetch (loading if necessary) a user's permission view.
    fn load_user(&self, user: UserId) -> impl Future<Output = Result<UserView>> + Send;

    /// Look up a group by name.
    fn get_group(&self, name: &str) -> impl Future<Output = Option<GroupView>> + Send;

    /// Transitive closure of groups the user inherits from, already resolved
    /// (and cycle-free) on the backend side.
    fn inherited_groups(
        &self,
        user: UserId,
    ) -> impl Future<Output = Result<Vec<GroupView>>> + Send;

    /// Replace nodes on the user and persist them.
    fn mutate_user_nodes(
        &self,
        user: UserId,
        mutation: &NodeMutation,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop any cached permission data for the user so the next read sees the
    /// new nodes.
    fn invalidate_user_cache(&self, user: UserId) -> impl Future<Output = ()> + Send;

    /// Register for topology change notifications. Dropping the returned
    /// handle unsubscribes.
    fn subscribe(&self, listener: TopologyListener) -> Subscription;
}

/// Host session state.
pub trait SessionDirectory: Send + Sync + 'static {
    /// Users currently loaded in memory.
    fn resident_users(&self) -> Vec<UserView>;

    /// Current display name for a user, if known.
    fn display_name(&self, user: UserId) -> Option<String>;
}

/// Owned registration with an event source; unsubscribes when dropped.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// A subscription with nothing to release.
    pub fn detached() -> Self {
        Self { release: None }
    }

    /// Unsubscribe now.
    pub fn release(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

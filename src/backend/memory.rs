//! In-process permission backend with an event bus.
//!
//! Groups inherit through `group.<name>` nodes, users through their primary
//! group plus their own `group.<name>` nodes. Administrative mutators publish
//! the same topology notifications a real backend would, including for the
//! engine's own node writes, so feedback filtering can be exercised end to
//! end. Fault injection hooks make loads and writes fail on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::backend::{
    GroupView, NodeMutation, PermissionBackend, SessionDirectory, Subscription, UserView,
};
use crate::engine::{ChangeKind, EntityRef, TopologyChange, TopologyListener};
use crate::error::{Error, Result};
use crate::types::{NodeKind, PermissionNode, UserId};

#[derive(Debug, Clone)]
struct StoredUser {
    name: Option<String>,
    primary_group: String,
    nodes: Vec<PermissionNode>,
    resident: bool,
}

type ListenerList = Arc<Mutex<Vec<(u64, TopologyListener)>>>;

/// Thread-safe in-memory permission store.
pub struct MemoryBackend {
    available: AtomicBool,
    groups: RwLock<FxHashMap<String, Vec<PermissionNode>>>,
    users: RwLock<FxHashMap<UserId, StoredUser>>,
    listeners: ListenerList,
    next_listener_id: AtomicU64,
    failing_loads: AtomicU32,
    failing_writes: AtomicU32,
    writes: Mutex<FxHashMap<UserId, u64>>,
    invalidations: Mutex<FxHashMap<UserId, u64>>,
}

impl MemoryBackend {
    /// Create an empty, available backend.
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            groups: RwLock::new(FxHashMap::default()),
            users: RwLock::new(FxHashMap::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener_id: AtomicU64::new(1),
            failing_loads: AtomicU32::new(0),
            failing_writes: AtomicU32::new(0),
            writes: Mutex::new(FxHashMap::default()),
            invalidations: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    // ========== Groups ==========

    /// Create a group if it does not exist yet.
    pub fn create_group(&self, name: &str) {
        self.groups.write().entry(name.to_string()).or_default();
    }

    /// Set a node on a group, replacing any node with the same key.
    pub fn set_group_node(&self, group: &str, node: PermissionNode) {
        {
            let mut groups = self.groups.write();
            let nodes = groups.entry(group.to_string()).or_default();
            nodes.retain(|n| n.key() != node.key());
            nodes.push(node.clone());
        }
        self.publish(TopologyChange {
            target: EntityRef::Group(group.to_string()),
            kind: ChangeKind::NodeAdded(node),
        });
    }

    /// Remove a node from a group by key.
    pub fn remove_group_node(&self, group: &str, key: &str) {
        let removed = {
            let mut groups = self.groups.write();
            match groups.get_mut(group) {
                Some(nodes) => {
                    let (gone, kept): (Vec<_>, Vec<_>) =
                        nodes.drain(..).partition(|n| n.key() == key);
                    *nodes = kept;
                    gone
                }
                None => Vec::new(),
            }
        };
        for node in removed {
            self.publish(TopologyChange {
                target: EntityRef::Group(group.to_string()),
                kind: ChangeKind::NodeRemoved(node),
            });
        }
    }

    /// Make `group` inherit from `parent`.
    pub fn add_group_parent(&self, group: &str, parent: &str) {
        self.set_group_node(group, PermissionNode::inherits(parent));
    }

    // ========== Users ==========

    /// Register a user with a primary group. Emits no notification.
    pub fn add_user(&self, id: UserId, name: &str, primary_group: &str, resident: bool) {
        self.create_group(primary_group);
        self.users.write().insert(
            id,
            StoredUser {
                name: Some(name.to_string()),
                primary_group: primary_group.to_string(),
                nodes: vec![PermissionNode::inherits(primary_group)],
                resident,
            },
        );
    }

    /// Mark a user as loaded or unloaded.
    pub fn set_resident(&self, id: UserId, resident: bool) {
        if let Some(user) = self.users.write().get_mut(&id) {
            user.resident = resident;
        }
    }

    /// Add a direct parent group to a user.
    pub fn add_user_parent(&self, id: UserId, group: &str) {
        let node = PermissionNode::inherits(group);
        let name = {
            let mut users = self.users.write();
            let Some(user) = users.get_mut(&id) else {
                return;
            };
            if !user.nodes.contains(&node) {
                user.nodes.push(node.clone());
            }
            user.name.clone()
        };
        self.publish(TopologyChange {
            target: EntityRef::User { id, name },
            kind: ChangeKind::NodeAdded(node),
        });
    }

    /// Remove a direct parent group from a user.
    pub fn remove_user_parent(&self, id: UserId, group: &str) {
        let node = PermissionNode::inherits(group);
        let name = {
            let mut users = self.users.write();
            let Some(user) = users.get_mut(&id) else {
                return;
            };
            let before = user.nodes.len();
            user.nodes.retain(|n| n != &node);
            if user.nodes.len() == before {
                return;
            }
            user.name.clone()
        };
        self.publish(TopologyChange {
            target: EntityRef::User { id, name },
            kind: ChangeKind::NodeRemoved(node),
        });
    }

    /// Move a user along a track to a higher group.
    pub fn promote(&self, id: UserId, group: &str) {
        if let Some(name) = self.move_primary(id, group) {
            self.publish(TopologyChange {
                target: EntityRef::User { id, name },
                kind: ChangeKind::Promoted,
            });
        }
    }

    /// Move a user along a track to a lower group.
    pub fn demote(&self, id: UserId, group: &str) {
        if let Some(name) = self.move_primary(id, group) {
            self.publish(TopologyChange {
                target: EntityRef::User { id, name },
                kind: ChangeKind::Demoted,
            });
        }
    }

    fn move_primary(&self, id: UserId, group: &str) -> Option<Option<String>> {
        self.create_group(group);
        let mut users = self.users.write();
        let user = users.get_mut(&id)?;
        let old = PermissionNode::inherits(&user.primary_group);
        user.nodes.retain(|n| n != &old);
        user.nodes.push(PermissionNode::inherits(group));
        user.primary_group = group.to_string();
        Some(user.name.clone())
    }

    /// Put a node directly on a user (as an administrator would).
    pub fn set_user_node(&self, id: UserId, node: PermissionNode) {
        if let Some(user) = self.users.write().get_mut(&id) {
            user.nodes.retain(|n| n.key() != node.key());
            user.nodes.push(node);
        }
    }

    /// Current own nodes of a user.
    pub fn user_nodes(&self, id: UserId) -> Vec<PermissionNode> {
        self.users
            .read()
            .get(&id)
            .map(|u| u.nodes.clone())
            .unwrap_or_default()
    }

    // ========== Fault injection & inspection ==========

    /// Make the next `count` user loads fail.
    pub fn fail_next_loads(&self, count: u32) {
        self.failing_loads.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` node writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful node writes for a user.
    pub fn write_count(&self, id: UserId) -> u64 {
        self.writes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of cache invalidations for a user.
    pub fn invalidation_count(&self, id: UserId) -> u64 {
        self.invalidations.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn publish(&self, change: TopologyChange) {
        // Listeners are cloned out so none runs under the lock
        let listeners: Vec<TopologyListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in listeners {
            listener.on_topology_changed(&change);
        }
    }

    /// Breadth-first inheritance closure starting at the primary group and
    /// the user's own parents. Visits each group once, so cycles terminate.
    fn closure(&self, user: &StoredUser) -> Vec<GroupView> {
        let groups = self.groups.read();
        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut queue: VecDeque<String> = VecDeque::new();
        let mut out = Vec::new();

        queue.push_back(user.primary_group.clone());
        for node in &user.nodes {
            if node.value() && node.kind() == NodeKind::Inheritance {
                if let Some(parent) = node.inherited_group() {
                    queue.push_back(parent.to_string());
                }
            }
        }

        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let Some(nodes) = groups.get(&name) else {
                continue;
            };
            for node in nodes {
                if node.value() && node.kind() == NodeKind::Inheritance {
                    if let Some(parent) = node.inherited_group() {
                        queue.push_back(parent.to_string());
                    }
                }
            }
            out.push(GroupView::new(name, nodes.clone()));
        }

        out
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionBackend for MemoryBackend {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn load_user(&self, user: UserId) -> Result<UserView> {
        if !self.is_available() {
            return Err(Error::BackendUnavailable);
        }
        if Self::take_failure(&self.failing_loads) {
            return Err(Error::UserLoadFailure {
                user,
                reason: "injected load failure".to_string(),
            });
        }
        let users = self.users.read();
        let stored = users.get(&user).ok_or_else(|| Error::UserLoadFailure {
            user,
            reason: "unknown user".to_string(),
        })?;
        Ok(UserView {
            id: user,
            username: stored.name.clone(),
            primary_group: stored.primary_group.clone(),
            nodes: stored.nodes.clone(),
        })
    }

    async fn get_group(&self, name: &str) -> Option<GroupView> {
        self.groups
            .read()
            .get(name)
            .map(|nodes| GroupView::new(name, nodes.clone()))
    }

    async fn inherited_groups(&self, user: UserId) -> Result<Vec<GroupView>> {
        let stored = self
            .users
            .read()
            .get(&user)
            .cloned()
            .ok_or_else(|| Error::UserLoadFailure {
                user,
                reason: "unknown user".to_string(),
            })?;
        Ok(self.closure(&stored))
    }

    async fn mutate_user_nodes(&self, user: UserId, mutation: &NodeMutation) -> Result<()> {
        if !self.is_available() {
            return Err(Error::BackendUnavailable);
        }
        if Self::take_failure(&self.failing_writes) {
            return Err(Error::NodeWrite {
                user,
                reason: "injected write failure".to_string(),
            });
        }

        let (name, removed) = {
            let mut users = self.users.write();
            let stored = users.get_mut(&user).ok_or_else(|| Error::NodeWrite {
                user,
                reason: "unknown user".to_string(),
            })?;
            let removed: Vec<PermissionNode> = stored
                .nodes
                .iter()
                .filter(|n| mutation.remove.iter().any(|k| k == n.key()))
                .cloned()
                .collect();
            mutation.apply_to(&mut stored.nodes);
            (stored.name.clone(), removed)
        };
        *self.writes.lock().entry(user).or_insert(0) += 1;
        debug!(
            "User {} nodes mutated: -{} +{}",
            user,
            removed.len(),
            mutation.add.len()
        );

        for node in removed {
            self.publish(TopologyChange {
                target: EntityRef::User {
                    id: user,
                    name: name.clone(),
                },
                kind: ChangeKind::NodeRemoved(node),
            });
        }
        for node in &mutation.add {
            self.publish(TopologyChange {
                target: EntityRef::User {
                    id: user,
                    name: name.clone(),
                },
                kind: ChangeKind::NodeAdded(node.clone()),
            });
        }
        Ok(())
    }

    async fn invalidate_user_cache(&self, user: UserId) {
        *self.invalidations.lock().entry(user).or_insert(0) += 1;
    }

    fn subscribe(&self, listener: TopologyListener) -> Subscription {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.lock().push((id, listener));

        let listeners = self.listeners.clone();
        Subscription::new(move || {
            listeners.lock().retain(|(lid, _)| *lid != id);
        })
    }
}

impl SessionDirectory for MemoryBackend {
    fn resident_users(&self) -> Vec<UserView> {
        self.users
            .read()
            .iter()
            .filter(|(_, u)| u.resident)
            .map(|(id, u)| UserView {
                id: *id,
                username: u.name.clone(),
                primary_group: u.primary_group.clone(),
                nodes: u.nodes.clone(),
            })
            .collect()
    }

    fn display_name(&self, user: UserId) -> Option<String> {
        self.users.read().get(&user).and_then(|u| u.name.clone())
    }
}

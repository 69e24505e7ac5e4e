//! Topology notifications and the filter that turns them into triggers.
//!
//! The engine's own quota writes come back through the same event bus as
//! every other change. They land on a user and carry a quota-prefixed key,
//! which is exactly the combination `classify` drops.

use tracing::debug;

use crate::engine::scheduler::SchedulerHandle;
use crate::metrics::METRICS;
use crate::types::{NodeKind, PermissionNode, QuotaPrefix, UserId};

/// The entity a notification is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    User { id: UserId, name: Option<String> },
    Group(String),
}

/// What happened to the entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    /// Moved up a track.
    Promoted,
    /// Moved down a track.
    Demoted,
    NodeAdded(PermissionNode),
    NodeRemoved(PermissionNode),
}

/// A single notification from the permission backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChange {
    pub target: EntityRef,
    pub kind: ChangeKind,
}

impl TopologyChange {
    pub fn user(id: UserId, name: Option<&str>, kind: ChangeKind) -> Self {
        Self {
            target: EntityRef::User {
                id,
                name: name.map(str::to_string),
            },
            kind,
        }
    }

    pub fn group(name: &str, kind: ChangeKind) -> Self {
        Self {
            target: EntityRef::Group(name.to_string()),
            kind,
        }
    }
}

/// Outcome of filtering a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Reconcile this one user.
    User { id: UserId, name: String },
    /// Reconcile every resident member of this group.
    Group(String),
    Ignore,
}

/// Decide whether a notification warrants reconciliation.
pub fn classify(change: &TopologyChange, prefix: &QuotaPrefix) -> Trigger {
    match (&change.target, &change.kind) {
        (EntityRef::User { id, name }, kind) => {
            let relevant = match kind {
                ChangeKind::Promoted | ChangeKind::Demoted => true,
                ChangeKind::NodeAdded(node) | ChangeKind::NodeRemoved(node) => {
                    node.kind() == NodeKind::Inheritance
                }
            };
            match name.as_deref() {
                Some(name) if relevant && !name.is_empty() => Trigger::User {
                    id: *id,
                    name: name.to_string(),
                },
                _ => Trigger::Ignore,
            }
        }
        (EntityRef::Group(group), ChangeKind::NodeAdded(node))
        | (EntityRef::Group(group), ChangeKind::NodeRemoved(node)) => {
            if prefix.matches(node.key()) {
                Trigger::Group(group.clone())
            } else {
                Trigger::Ignore
            }
        }
        (EntityRef::Group(_), _) => Trigger::Ignore,
    }
}

/// Callback the engine registers with a backend.
///
/// Cheap to clone. Callbacks never block: qualifying notifications are handed
/// to the scheduler and the call returns.
#[derive(Clone)]
pub struct TopologyListener {
    scheduler: SchedulerHandle,
    prefix: QuotaPrefix,
}

impl TopologyListener {
    pub fn new(scheduler: SchedulerHandle, prefix: QuotaPrefix) -> Self {
        Self { scheduler, prefix }
    }

    /// Handle a topology notification. Returns whether anything was scheduled.
    pub fn on_topology_changed(&self, change: &TopologyChange) -> bool {
        if !self.scheduler.is_enabled() {
            return false;
        }
        METRICS.inc(&METRICS.events_received);

        match classify(change, &self.prefix) {
            Trigger::User { id, name } => self.scheduler.schedule(id, name),
            Trigger::Group(group) => self.scheduler.fan_out(group),
            Trigger::Ignore => {
                METRICS.inc(&METRICS.events_ignored);
                debug!("Ignoring topology change {:?}", change);
                false
            }
        }
    }

    /// Handle a user joining. Nameless joins are dropped.
    pub fn on_user_joined(&self, user: UserId, name: &str) -> bool {
        if !self.scheduler.is_enabled() {
            return false;
        }
        METRICS.inc(&METRICS.events_received);

        if name.is_empty() {
            METRICS.inc(&METRICS.events_ignored);
            debug!("Ignoring join of nameless user {}", user);
            return false;
        }
        self.scheduler.schedule_join(user, name.to_string())
    }
}

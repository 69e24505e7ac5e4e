//! Merges the group-derived limit and the ledger bonus into one quota node.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use crate::backend::{NodeMutation, PermissionBackend};
use crate::engine::ledger::BonusLedger;
use crate::engine::resolver::resolve_limit;
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::types::{PermissionNode, QuotaPrefix, UserId};

/// Reconciler tuning.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Attempts for a node write before giving up (at least 1).
    pub max_write_attempts: u32,
    /// Pause between write attempts.
    pub write_retry_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_write_attempts: 3,
            write_retry_delay: Duration::from_millis(50),
        }
    }
}

/// Result of one successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub group_limit: u64,
    pub bonus: u64,
    pub total: u64,
    /// False when the user already carried exactly the right node.
    pub changed: bool,
}

/// Compute the single mutation that leaves exactly one quota node,
/// `{prefix}{total}=true`, on a user.
///
/// Returns an empty mutation when the node set is already canonical.
pub fn plan_quota_mutation(
    prefix: &QuotaPrefix,
    nodes: &[PermissionNode],
    total: u64,
) -> NodeMutation {
    let desired = prefix.node_for(total);
    let mut seen = FxHashSet::default();
    let mut remove = Vec::new();

    for node in nodes {
        if prefix.matches(node.key()) && node != &desired && seen.insert(node.key()) {
            remove.push(node.key().to_string());
        }
    }

    // A key removal drops every node with that key, including a desired one
    let present = nodes.contains(&desired) && !seen.contains(desired.key());
    let add = if present { Vec::new() } else { vec![desired] };

    NodeMutation { remove, add }
}

/// Applies quota nodes to users, one user at a time.
pub struct Reconciler<B> {
    backend: Arc<B>,
    ledger: Arc<BonusLedger>,
    prefix: QuotaPrefix,
    config: ReconcilerConfig,
    locks: Mutex<FxHashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl<B: PermissionBackend> Reconciler<B> {
    pub fn new(
        backend: Arc<B>,
        ledger: Arc<BonusLedger>,
        prefix: QuotaPrefix,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            backend,
            ledger,
            prefix,
            config,
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn ledger(&self) -> &Arc<BonusLedger> {
        &self.ledger
    }

    pub fn prefix(&self) -> &QuotaPrefix {
        &self.prefix
    }

    /// Bring the user's quota node in line with groups and ledger.
    ///
    /// Serialized per user; different users run in parallel. Any failure
    /// leaves the user's nodes untouched.
    pub async fn reconcile(&self, user: UserId, name: &str) -> Result<Reconciliation> {
        let lock = self.user_lock(user);
        let _guard = lock.lock().await;

        match self.reconcile_locked(user, name).await {
            Ok(outcome) => {
                if outcome.changed {
                    METRICS.inc(&METRICS.reconciliations_applied);
                    info!(
                        "Updated quota for {} (group: {}, bonus: {}, total: {})",
                        name, outcome.group_limit, outcome.bonus, outcome.total
                    );
                } else {
                    METRICS.inc(&METRICS.reconciliations_unchanged);
                    debug!("Quota for {} already {}", name, outcome.total);
                }
                Ok(outcome)
            }
            Err(e) => {
                METRICS.inc(&METRICS.reconciliations_failed);
                match &e {
                    Error::NodeWrite { .. } => {
                        error!("Failed to write quota node for {} ({}): {}", name, user, e)
                    }
                    _ => warn!("Skipping quota update for {} ({}): {}", name, user, e),
                }
                Err(e)
            }
        }
    }

    async fn reconcile_locked(&self, user: UserId, name: &str) -> Result<Reconciliation> {
        if !self.backend.is_available() {
            return Err(Error::BackendUnavailable);
        }

        let view = self.backend.load_user(user).await?;
        let primary = self.backend.get_group(&view.primary_group).await;
        let inherited = self.backend.inherited_groups(user).await?;

        let group_limit = resolve_limit(&self.prefix, primary.as_ref(), &inherited);
        let bonus = self.ledger.get(user);
        let total = group_limit.saturating_add(bonus);

        let mutation = plan_quota_mutation(&self.prefix, &view.nodes, total);
        let changed = !mutation.is_empty();
        if changed {
            self.write_with_retry(user, name, &mutation).await?;
            self.backend.invalidate_user_cache(user).await;
        }

        Ok(Reconciliation {
            group_limit,
            bonus,
            total,
            changed,
        })
    }

    async fn write_with_retry(
        &self,
        user: UserId,
        name: &str,
        mutation: &NodeMutation,
    ) -> Result<()> {
        let attempts = self.config.max_write_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.backend.mutate_user_nodes(user, mutation).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    METRICS.inc(&METRICS.node_write_retries);
                    warn!(
                        "Quota node write for {} failed (attempt {}/{}): {}",
                        name, attempt, attempts, e
                    );
                    tokio::time::sleep(self.config.write_retry_delay).await;
                    attempt += 1;
                }
                Err(e @ Error::NodeWrite { .. }) => return Err(e),
                Err(e) => {
                    return Err(Error::NodeWrite {
                        user,
                        reason: e.to_string(),
                    })
                }
            }
        }
    }

    /// Per-user lock, dropping entries nobody else holds.
    fn user_lock(&self, user: UserId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        let lock = locks.entry(user).or_default().clone();
        locks.retain(|_, l| Arc::strong_count(l) > 1);
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::persistence::PersistenceConfig;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        reconciler: Arc<Reconciler<MemoryBackend>>,
        dir: std::path::PathBuf,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("quota-sync-test-{}", name));
            let _ = std::fs::remove_dir_all(&dir);
            let ledger = Arc::new(BonusLedger::open(&PersistenceConfig::new(&dir)).unwrap());
            let backend = Arc::new(MemoryBackend::new());
            let reconciler = Arc::new(Reconciler::new(
                backend.clone(),
                ledger,
                QuotaPrefix::default(),
                ReconcilerConfig {
                    max_write_attempts: 3,
                    write_retry_delay: Duration::from_millis(1),
                },
            ));
            Self {
                backend,
                reconciler,
                dir,
            }
        }

        fn quota_nodes(&self, user: UserId) -> Vec<PermissionNode> {
            self.backend
                .user_nodes(user)
                .into_iter()
                .filter(|n| self.reconciler.prefix().matches(n.key()))
                .collect()
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    #[test]
    fn test_plan_noop_when_canonical() {
        let prefix = QuotaPrefix::default();
        let nodes = vec![
            PermissionNode::inherits("default"),
            PermissionNode::granted("axplayerwarps.warps.5"),
        ];
        assert!(plan_quota_mutation(&prefix, &nodes, 5).is_empty());
    }

    #[test]
    fn test_plan_replaces_stale_nodes() {
        let prefix = QuotaPrefix::default();
        let nodes = vec![
            PermissionNode::granted("axplayerwarps.warps.3"),
            PermissionNode::granted("axplayerwarps.warps.3"),
            PermissionNode::granted("axplayerwarps.warps.abc"),
            PermissionNode::granted("essentials.home"),
        ];
        let plan = plan_quota_mutation(&prefix, &nodes, 8);
        assert_eq!(
            plan.remove,
            vec!["axplayerwarps.warps.3", "axplayerwarps.warps.abc"]
        );
        assert_eq!(plan.add, vec![PermissionNode::granted("axplayerwarps.warps.8")]);
    }

    #[test]
    fn test_plan_readds_when_key_shadowed() {
        let prefix = QuotaPrefix::default();
        // Same key with the wrong value forces removal of the key, so the
        // desired node has to be added back.
        let nodes = vec![
            PermissionNode::granted("axplayerwarps.warps.4"),
            PermissionNode::new("axplayerwarps.warps.4", false),
        ];
        let plan = plan_quota_mutation(&prefix, &nodes, 4);
        assert_eq!(plan.remove, vec!["axplayerwarps.warps.4"]);
        assert_eq!(plan.add, vec![PermissionNode::granted("axplayerwarps.warps.4")]);
    }

    #[tokio::test]
    async fn test_group_plus_bonus() {
        let fx = Fixture::new("reconcile-sum");
        fx.backend
            .set_group_node("vip", PermissionNode::granted("axplayerwarps.warps.3"));
        let user = UserId::random();
        fx.backend.add_user(user, "alice", "vip", true);
        fx.reconciler.ledger().set(user, 2).unwrap();

        let outcome = fx.reconciler.reconcile(user, "alice").await.unwrap();
        assert_eq!(
            outcome,
            Reconciliation {
                group_limit: 3,
                bonus: 2,
                total: 5,
                changed: true
            }
        );
        assert_eq!(
            fx.quota_nodes(user),
            vec![PermissionNode::granted("axplayerwarps.warps.5")]
        );
        assert_eq!(fx.backend.invalidation_count(user), 1);
    }

    #[tokio::test]
    async fn test_inherited_max() {
        let fx = Fixture::new("reconcile-inherited");
        fx.backend
            .set_group_node("vip", PermissionNode::granted("axplayerwarps.warps.3"));
        fx.backend
            .set_group_node("donor", PermissionNode::granted("axplayerwarps.warps.7"));
        let user = UserId::random();
        fx.backend.add_user(user, "bob", "default", true);
        fx.backend.add_user_parent(user, "vip");
        fx.backend.add_user_parent(user, "donor");

        let outcome = fx.reconciler.reconcile(user, "bob").await.unwrap();
        assert_eq!(outcome.total, 7);
        assert_eq!(
            fx.quota_nodes(user),
            vec![PermissionNode::granted("axplayerwarps.warps.7")]
        );
    }

    #[tokio::test]
    async fn test_idempotent() {
        let fx = Fixture::new("reconcile-idempotent");
        fx.backend
            .set_group_node("vip", PermissionNode::granted("axplayerwarps.warps.3"));
        let user = UserId::random();
        fx.backend.add_user(user, "carol", "vip", true);

        let first = fx.reconciler.reconcile(user, "carol").await.unwrap();
        let second = fx.reconciler.reconcile(user, "carol").await.unwrap();

        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.total, 3);
        assert_eq!(fx.backend.write_count(user), 1);
        assert_eq!(fx.quota_nodes(user).len(), 1);
    }

    #[tokio::test]
    async fn test_own_nodes_do_not_feed_back() {
        let fx = Fixture::new("reconcile-own-nodes");
        fx.backend
            .set_group_node("vip", PermissionNode::granted("axplayerwarps.warps.3"));
        let user = UserId::random();
        fx.backend.add_user(user, "dave", "vip", true);
        fx.backend
            .set_user_node(user, PermissionNode::granted("axplayerwarps.warps.50"));

        let outcome = fx.reconciler.reconcile(user, "dave").await.unwrap();
        assert_eq!(outcome.group_limit, 3);
        assert_eq!(
            fx.quota_nodes(user),
            vec![PermissionNode::granted("axplayerwarps.warps.3")]
        );
    }

    #[tokio::test]
    async fn test_no_groups_gives_bonus_only() {
        let fx = Fixture::new("reconcile-bonus-only");
        let user = UserId::random();
        fx.backend.add_user(user, "erin", "default", true);
        fx.reconciler.ledger().set(user, 4).unwrap();

        let outcome = fx.reconciler.reconcile(user, "erin").await.unwrap();
        assert_eq!(outcome.group_limit, 0);
        assert_eq!(outcome.total, 4);
    }

    #[tokio::test]
    async fn test_load_failure_mutates_nothing() {
        let fx = Fixture::new("reconcile-load-failure");
        let user = UserId::random();
        fx.backend.add_user(user, "frank", "default", true);
        fx.backend.fail_next_loads(1);

        let result = fx.reconciler.reconcile(user, "frank").await;
        assert!(matches!(result, Err(Error::UserLoadFailure { .. })));
        assert_eq!(fx.backend.write_count(user), 0);
        assert!(fx.quota_nodes(user).is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_mutates_nothing() {
        let fx = Fixture::new("reconcile-unavailable");
        let user = UserId::random();
        fx.backend.add_user(user, "grace", "default", true);
        fx.backend.set_available(false);

        let result = fx.reconciler.reconcile(user, "grace").await;
        assert!(matches!(result, Err(Error::BackendUnavailable)));
        assert_eq!(fx.backend.write_count(user), 0);
    }

    #[tokio::test]
    async fn test_write_retried_until_success() {
        let fx = Fixture::new("reconcile-retry");
        let user = UserId::random();
        fx.backend.add_user(user, "heidi", "default", true);
        fx.reconciler.ledger().set(user, 1).unwrap();
        fx.backend.fail_next_writes(2);

        let outcome = fx.reconciler.reconcile(user, "heidi").await.unwrap();
        assert!(outcome.changed);
        assert_eq!(fx.backend.write_count(user), 1);
    }

    #[tokio::test]
    async fn test_write_gives_up_after_bounded_attempts() {
        let fx = Fixture::new("reconcile-give-up");
        let user = UserId::random();
        fx.backend.add_user(user, "ivan", "default", true);
        fx.reconciler.ledger().set(user, 1).unwrap();
        fx.backend.fail_next_writes(3);

        let result = fx.reconciler.reconcile(user, "ivan").await;
        assert!(matches!(result, Err(Error::NodeWrite { .. })));
        assert_eq!(fx.backend.write_count(user), 0);
        assert!(fx.quota_nodes(user).is_empty());
        // Ledger is untouched by node write failures
        assert_eq!(fx.reconciler.ledger().get(user), 1);
    }

    #[tokio::test]
    async fn test_lock_table_is_pruned() {
        let fx = Fixture::new("reconcile-locks");
        for i in 0..10 {
            let user = UserId::random();
            fx.backend.add_user(user, &format!("u{}", i), "default", true);
            fx.reconciler.reconcile(user, "u").await.unwrap();
        }
        assert!(fx.reconciler.locks.lock().len() <= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_overlapping_reconciles_leave_one_current_node() {
        let fx = Fixture::new("reconcile-overlap");
        fx.backend
            .set_group_node("vip", PermissionNode::granted("axplayerwarps.warps.3"));
        let user = UserId::random();
        fx.backend.add_user(user, "judy", "vip", true);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..50 {
            let reconciler = fx.reconciler.clone();
            tasks.spawn(async move {
                reconciler.ledger().add(user, 1).unwrap();
                reconciler.reconcile(user, "judy").await.unwrap();
            });
        }
        while let Some(done) = tasks.join_next().await {
            done.unwrap();
        }

        assert_eq!(fx.reconciler.ledger().get(user), 50);
        assert_eq!(
            fx.quota_nodes(user),
            vec![PermissionNode::granted("axplayerwarps.warps.53")]
        );
    }
}

//! Debouncing scheduler for reconciliations.
//!
//! Each user is either idle or has exactly one pending timer. A trigger for an
//! idle user starts a timer; triggers for a pending user only refresh the name
//! the reconciliation will log under. When the timer fires the pending entry is
//! removed and the reconciliation runs against whatever state exists at that
//! moment, so a burst of changes collapses into one write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::{PermissionBackend, SessionDirectory};
use crate::engine::fanout::fan_out;
use crate::engine::reconciler::Reconciler;
use crate::metrics::METRICS;
use crate::types::UserId;

/// Scheduler timing and capacity.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Debounce delay for topology triggers (default: 1s)
    pub reconcile_delay: Duration,
    /// Delay after a user joins (default: 1s)
    pub join_delay: Duration,
    /// Request channel capacity (default: 1024)
    pub channel_capacity: usize,
    /// How long shutdown waits for in-flight work (default: 5s)
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_delay: Duration::from_millis(1000),
            join_delay: Duration::from_millis(1000),
            channel_capacity: 1024,
            shutdown_grace: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug)]
enum Request {
    Schedule {
        user: UserId,
        name: String,
        delay: Duration,
    },
    FanOut {
        group: String,
    },
    Shutdown,
}

/// Handle for submitting work to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Request>,
    enabled: Arc<AtomicBool>,
    reconcile_delay: Duration,
    join_delay: Duration,
}

impl SchedulerHandle {
    /// False once shutdown has begun.
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Schedule a reconciliation after the debounce delay.
    pub fn schedule(&self, user: UserId, name: String) -> bool {
        self.schedule_after(user, name, self.reconcile_delay)
    }

    /// Schedule a reconciliation after the join delay.
    pub fn schedule_join(&self, user: UserId, name: String) -> bool {
        self.schedule_after(user, name, self.join_delay)
    }

    pub fn schedule_after(&self, user: UserId, name: String, delay: Duration) -> bool {
        self.send(Request::Schedule { user, name, delay })
    }

    /// Reconcile every resident member of a group.
    pub fn fan_out(&self, group: String) -> bool {
        self.send(Request::FanOut { group })
    }

    /// Stop accepting work and tell the scheduler loop to drain.
    pub async fn shutdown(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            // Sent even if the queue is full; shutdown must not be dropped
            let _ = self.tx.send(Request::Shutdown).await;
        }
    }

    /// Stop accepting work without waiting. The loop is told to drain if the
    /// queue has room; callers that need it gone abort its task.
    pub fn disable(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            let _ = self.tx.try_send(Request::Shutdown);
        }
    }

    fn send(&self, request: Request) -> bool {
        if !self.is_enabled() {
            return false;
        }
        // try_send keeps event callbacks non-blocking; a full queue drops work
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                METRICS.inc(&METRICS.requests_dropped);
                warn!("Scheduler backpressure: dropped {:?}", request);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Scheduler stopped, request discarded");
                false
            }
        }
    }
}

struct Pending {
    name: String,
}

/// Owns per-user timers and in-flight reconciliations.
pub struct Scheduler<B> {
    config: SchedulerConfig,
    reconciler: Arc<Reconciler<B>>,
    handle: SchedulerHandle,
    rx: mpsc::Receiver<Request>,
    pending: FxHashMap<UserId, Pending>,
    timers: JoinSet<UserId>,
    in_flight: JoinSet<()>,
}

impl<B: PermissionBackend + SessionDirectory> Scheduler<B> {
    /// Create a scheduler and the handle used to feed it.
    pub fn new(config: SchedulerConfig, reconciler: Arc<Reconciler<B>>) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));

        let handle = SchedulerHandle {
            tx,
            enabled: Arc::new(AtomicBool::new(true)),
            reconcile_delay: config.reconcile_delay,
            join_delay: config.join_delay,
        };

        let scheduler = Self {
            config,
            reconciler,
            handle: handle.clone(),
            rx,
            pending: FxHashMap::default(),
            timers: JoinSet::new(),
            in_flight: JoinSet::new(),
        };

        (scheduler, handle)
    }

    /// Run until shutdown is requested, then drain.
    pub async fn run(mut self) {
        debug!("Quota scheduler started");

        loop {
            tokio::select! {
                request = self.rx.recv() => {
                    match request {
                        Some(Request::Schedule { user, name, delay }) => {
                            self.handle_schedule(user, name, delay);
                        }
                        Some(Request::FanOut { group }) => {
                            self.spawn_fan_out(group);
                        }
                        Some(Request::Shutdown) | None => break,
                    }
                }

                Some(fired) = self.timers.join_next() => {
                    match fired {
                        Ok(user) => self.fire(user),
                        Err(e) if e.is_panic() => error!("Reconcile timer panicked: {}", e),
                        Err(_) => {}
                    }
                }

                Some(done) = self.in_flight.join_next() => {
                    if let Err(e) = done {
                        if e.is_panic() {
                            error!("Reconciliation task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.drain().await;
    }

    fn handle_schedule(&mut self, user: UserId, name: String, delay: Duration) {
        if let Some(pending) = self.pending.get_mut(&user) {
            METRICS.inc(&METRICS.triggers_coalesced);
            debug!("Coalesced trigger for {} into pending reconcile", name);
            pending.name = name;
            return;
        }

        self.pending.insert(user, Pending { name });
        self.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            user
        });
    }

    fn fire(&mut self, user: UserId) {
        let Some(pending) = self.pending.remove(&user) else {
            return;
        };
        let reconciler = self.reconciler.clone();
        self.in_flight.spawn(async move {
            // Failures are logged by the reconciler; the loop keeps going
            let _ = reconciler.reconcile(user, &pending.name).await;
        });
    }

    fn spawn_fan_out(&mut self, group: String) {
        let backend = self.reconciler.backend().clone();
        let handle = self.handle.clone();
        self.in_flight.spawn(async move {
            fan_out(&*backend, &group, &handle).await;
        });
    }

    async fn drain(&mut self) {
        let abandoned = self.pending.len();
        self.pending.clear();
        self.timers.shutdown().await;

        let grace = self.config.shutdown_grace;
        let in_flight = &mut self.in_flight;
        let finished = tokio::time::timeout(grace, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                "Abandoning {} in-flight reconciliations after {:?}",
                self.in_flight.len(),
                grace
            );
            self.in_flight.shutdown().await;
        }

        info!(
            "Quota scheduler stopped ({} pending triggers discarded)",
            abandoned
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::engine::ledger::BonusLedger;
    use crate::engine::reconciler::ReconcilerConfig;
    use crate::persistence::PersistenceConfig;
    use crate::types::{PermissionNode, QuotaPrefix};

    struct Fixture {
        backend: Arc<MemoryBackend>,
        ledger: Arc<BonusLedger>,
        handle: SchedulerHandle,
        task: Option<tokio::task::JoinHandle<()>>,
        dir: std::path::PathBuf,
    }

    impl Fixture {
        fn start(name: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("quota-sync-test-{}", name));
            let _ = std::fs::remove_dir_all(&dir);
            let ledger = Arc::new(BonusLedger::open(&PersistenceConfig::new(&dir)).unwrap());
            let backend = Arc::new(MemoryBackend::new());
            let reconciler = Arc::new(Reconciler::new(
                backend.clone(),
                ledger.clone(),
                QuotaPrefix::default(),
                ReconcilerConfig::default(),
            ));
            let (scheduler, handle) = Scheduler::new(SchedulerConfig::default(), reconciler);
            let task = tokio::spawn(scheduler.run());
            Self {
                backend,
                ledger,
                handle,
                task: Some(task),
                dir,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_into_one_reconcile() {
        let fx = Fixture::start("scheduler-burst");
        let user = UserId::random();
        fx.backend.add_user(user, "alice", "default", true);

        for bonus in 1..=5 {
            fx.ledger.set(user, bonus).unwrap();
            assert!(fx.handle.schedule(user, "alice".into()));
        }
        settle().await;

        assert_eq!(fx.backend.write_count(user), 1);
        assert_eq!(
            fx.backend.user_nodes(user).last(),
            Some(&PermissionNode::granted("axplayerwarps.warps.5"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_runs_before_delay() {
        let fx = Fixture::start("scheduler-delay");
        let user = UserId::random();
        fx.backend.add_user(user, "bob", "default", true);
        fx.ledger.set(user, 2).unwrap();

        fx.handle.schedule(user, "bob".into());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(fx.backend.write_count(user), 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fx.backend.write_count(user), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_uses_state_at_fire_time() {
        let fx = Fixture::start("scheduler-fire-time");
        let user = UserId::random();
        fx.backend.add_user(user, "carol", "default", true);

        fx.handle.schedule(user, "carol".into());
        tokio::time::sleep(Duration::from_millis(900)).await;
        fx.backend
            .set_group_node("default", PermissionNode::granted("axplayerwarps.warps.6"));
        settle().await;

        assert!(fx
            .backend
            .user_nodes(user)
            .contains(&PermissionNode::granted("axplayerwarps.warps.6")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_separate_windows_reconcile_separately() {
        let fx = Fixture::start("scheduler-windows");
        let user = UserId::random();
        fx.backend.add_user(user, "dave", "default", true);

        fx.ledger.set(user, 1).unwrap();
        fx.handle.schedule(user, "dave".into());
        settle().await;
        fx.ledger.set(user, 2).unwrap();
        fx.handle.schedule(user, "dave".into());
        settle().await;

        assert_eq!(fx.backend.write_count(user), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_are_independent() {
        let fx = Fixture::start("scheduler-independent");
        let a = UserId::random();
        let b = UserId::random();
        fx.backend.add_user(a, "erin", "default", true);
        fx.backend.add_user(b, "frank", "default", true);
        fx.ledger.set(a, 1).unwrap();
        fx.ledger.set(b, 1).unwrap();

        fx.handle.schedule(a, "erin".into());
        fx.handle.schedule(b, "frank".into());
        settle().await;

        assert_eq!(fx.backend.write_count(a), 1);
        assert_eq!(fx.backend.write_count(b), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_does_not_stop_loop() {
        let fx = Fixture::start("scheduler-failure");
        let user = UserId::random();
        fx.backend.add_user(user, "grace", "default", true);
        fx.ledger.set(user, 1).unwrap();

        fx.backend.fail_next_loads(1);
        fx.handle.schedule(user, "grace".into());
        settle().await;
        assert_eq!(fx.backend.write_count(user), 0);

        fx.handle.schedule(user, "grace".into());
        settle().await;
        assert_eq!(fx.backend.write_count(user), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_pending_and_refuses_work() {
        let mut fx = Fixture::start("scheduler-shutdown");
        let user = UserId::random();
        fx.backend.add_user(user, "heidi", "default", true);
        fx.ledger.set(user, 1).unwrap();

        fx.handle.schedule(user, "heidi".into());
        fx.handle.shutdown().await;
        fx.task.take().unwrap().await.unwrap();

        assert!(!fx.handle.is_enabled());
        assert!(!fx.handle.schedule(user, "heidi".into()));
        settle().await;
        assert_eq!(fx.backend.write_count(user), 0);
    }
}

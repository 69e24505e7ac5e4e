//! The engine facade a host embeds.
//!
//! `QuotaSync` wires the ledger, reconciler and scheduler together, registers
//! with the backend's event bus and exposes the administrative operations.
//! It must be started inside a tokio runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::backend::{PermissionBackend, SessionDirectory, Subscription};
use crate::engine::events::{TopologyChange, TopologyListener};
use crate::engine::ledger::BonusLedger;
use crate::engine::reconciler::{Reconciler, ReconcilerConfig, Reconciliation};
use crate::engine::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::persistence::PersistenceConfig;
use crate::types::{QuotaPrefix, UserId};

/// Everything the engine needs to start.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub prefix: QuotaPrefix,
    pub persistence: PersistenceConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
}

/// Running quota synchronization engine.
pub struct QuotaSync<B> {
    backend: Arc<B>,
    ledger: Arc<BonusLedger>,
    reconciler: Arc<Reconciler<B>>,
    scheduler: SchedulerHandle,
    listener: TopologyListener,
    subscription: Mutex<Option<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<B: PermissionBackend + SessionDirectory> QuotaSync<B> {
    /// Open the ledger, subscribe to the backend and start the scheduler.
    ///
    /// Refuses to start when the backend is unavailable.
    pub fn start(config: EngineConfig, backend: Arc<B>) -> Result<Self> {
        Self::ensure_available(&*backend)?;
        let ledger = Arc::new(BonusLedger::open(&config.persistence)?);
        Self::with_ledger(config, backend, ledger)
    }

    /// Start with an already opened ledger.
    pub fn with_ledger(
        config: EngineConfig,
        backend: Arc<B>,
        ledger: Arc<BonusLedger>,
    ) -> Result<Self> {
        Self::ensure_available(&*backend)?;

        let reconciler = Arc::new(Reconciler::new(
            backend.clone(),
            ledger.clone(),
            config.prefix.clone(),
            config.reconciler,
        ));
        let (scheduler, handle) = Scheduler::new(config.scheduler, reconciler.clone());
        let task = tokio::spawn(scheduler.run());

        let listener = TopologyListener::new(handle.clone(), config.prefix.clone());
        let subscription = backend.subscribe(listener.clone());

        info!(
            "Quota sync enabled (prefix: {}, {} bonus entries)",
            config.prefix,
            ledger.len()
        );

        Ok(Self {
            backend,
            ledger,
            reconciler,
            scheduler: handle,
            listener,
            subscription: Mutex::new(Some(subscription)),
            task: Mutex::new(Some(task)),
        })
    }

    fn ensure_available(backend: &B) -> Result<()> {
        if backend.is_available() {
            Ok(())
        } else {
            error!("Permission backend not available, quota sync will not be enabled");
            Err(Error::BackendUnavailable)
        }
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.scheduler.is_enabled() {
            Ok(())
        } else {
            Err(Error::Disabled)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.scheduler.is_enabled()
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn ledger(&self) -> &Arc<BonusLedger> {
        &self.ledger
    }

    /// Listener to register with additional event sources.
    pub fn listener(&self) -> TopologyListener {
        self.listener.clone()
    }

    // ========== Administrative operations ==========

    /// Grant one extra unit of quota.
    pub fn add_bonus(&self, user: UserId, name: &str) -> Result<u64> {
        self.add_bonus_by(user, name, 1)
    }

    /// Grant `amount` extra units. `amount` must be positive.
    pub fn add_bonus_by(&self, user: UserId, name: &str, amount: i64) -> Result<u64> {
        self.ensure_enabled()?;
        if amount <= 0 {
            return Err(Error::Validation(format!(
                "amount must be positive (got {})",
                amount
            )));
        }
        let bonus = self.ledger.add(user, amount as u64)?;
        info!("Added {} bonus to {}, now {}", amount, name, bonus);
        self.schedule_admin(user, name);
        Ok(bonus)
    }

    /// Replace the bonus. 0 clears it; negative amounts are rejected.
    pub fn set_bonus(&self, user: UserId, name: &str, amount: i64) -> Result<u64> {
        self.ensure_enabled()?;
        let bonus = self.ledger.set(user, amount)?;
        info!("Set bonus for {} to {}", name, bonus);
        self.schedule_admin(user, name);
        Ok(bonus)
    }

    pub fn get_bonus(&self, user: UserId) -> u64 {
        self.ledger.get(user)
    }

    /// All bonuses keyed by display name.
    ///
    /// Unknown names fall back to the UUID string, as do names shared by more
    /// than one user.
    pub fn list_bonuses(&self) -> BTreeMap<String, u64> {
        let entries: Vec<(UserId, Option<String>, u64)> = self
            .ledger
            .list_all()
            .into_iter()
            .map(|(user, bonus)| {
                let name = self
                    .backend
                    .display_name(user)
                    .filter(|n| !n.is_empty());
                (user, name, bonus)
            })
            .collect();

        let mut name_counts: FxHashMap<&str, usize> = FxHashMap::default();
        for (_, name, _) in &entries {
            if let Some(name) = name {
                *name_counts.entry(name.as_str()).or_insert(0) += 1;
            }
        }

        entries
            .iter()
            .map(|(user, name, bonus)| {
                let key = match name {
                    Some(name) if name_counts.get(name.as_str()) == Some(&1) => name.clone(),
                    _ => user.to_string(),
                };
                (key, *bonus)
            })
            .collect()
    }

    /// Reconcile immediately, bypassing the debounce.
    pub async fn reconcile_now(&self, user: UserId, name: &str) -> Result<Reconciliation> {
        self.ensure_enabled()?;
        self.reconciler.reconcile(user, name).await
    }

    // ========== Event intake ==========

    pub fn on_topology_changed(&self, change: &TopologyChange) -> bool {
        self.listener.on_topology_changed(change)
    }

    pub fn on_user_joined(&self, user: UserId, name: &str) -> bool {
        self.listener.on_user_joined(user, name)
    }

    fn schedule_admin(&self, user: UserId, name: &str) {
        let name = if name.is_empty() {
            user.to_string()
        } else {
            name.to_string()
        };
        self.scheduler.schedule(user, name);
    }

    /// Unsubscribe, stop scheduling and wait for in-flight work.
    pub async fn shutdown(&self) {
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.release();
        }
        self.scheduler.shutdown().await;

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Quota scheduler task failed: {}", e);
            }
        }

        info!("Quota sync disabled");
        debug!("Quota sync metrics:\n{}", METRICS.snapshot().to_info_string());
    }
}

impl<B> Drop for QuotaSync<B> {
    /// Dropping without `shutdown` stops everything at once: pending timers
    /// and in-flight reconciliations are aborted with the scheduler task.
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.get_mut().take() {
            subscription.release();
        }
        self.scheduler.disable();
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

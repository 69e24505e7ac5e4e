//! Durable per-user bonus counts.
//!
//! The ledger keeps the authoritative map in memory and rewrites the whole
//! file atomically on every mutation. Mutations are serialized by a writer
//! lock and only become visible in memory after the file has been replaced,
//! so a failed write leaves both the map and the file as they were. Readers
//! only take the map lock, which is never held across file I/O.
//!
//! The data directory is owned by one ledger at a time: `open` takes an
//! exclusive advisory lock on `bonus_ledger.lock` and holds it until drop.
//!
//! A bonus of 0 is stored as absence: setting 0 deletes the entry and it no
//! longer appears in `list_all`.

use std::fs::File;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics::METRICS;
use crate::persistence::{
    lock_exclusive, read_ledger, write_ledger, LedgerRecord, PersistenceConfig,
};
use crate::types::UserId;

/// Bonus counts keyed by user.
pub struct BonusLedger {
    path: PathBuf,
    entries: RwLock<FxHashMap<UserId, u64>>,
    writer: Mutex<()>,
    _lock: File,
}

impl BonusLedger {
    /// Open the ledger, creating an empty file if none exists.
    ///
    /// Fails with `Persistence` if another ledger holds the data directory.
    pub fn open(config: &PersistenceConfig) -> Result<Self> {
        let path = config.ledger_path();
        std::fs::create_dir_all(&config.data_dir)?;

        let lock_path = config.lock_path();
        let lock = lock_exclusive(&lock_path)?.ok_or_else(|| {
            Error::Persistence(format!(
                "ledger in {:?} is in use by another process",
                config.data_dir
            ))
        })?;

        let entries = if path.exists() {
            let loaded = read_ledger(&path).map_err(|e| {
                Error::Persistence(format!("cannot read ledger {:?}: {}", path, e))
            })?;
            if loaded.skipped > 0 {
                warn!(
                    "Ledger {:?}: skipped {} malformed records",
                    path, loaded.skipped
                );
                METRICS.add(&METRICS.ledger_records_skipped, loaded.skipped as u64);
            }
            let mut entries = FxHashMap::default();
            for record in loaded.records {
                let user = UserId::from_u128(record.user);
                if record.bonus > 0 {
                    entries.insert(user, record.bonus);
                } else {
                    entries.remove(&user);
                }
            }
            entries
        } else {
            write_ledger(&path, &[]).map_err(|e| {
                Error::Persistence(format!("cannot create ledger {:?}: {}", path, e))
            })?;
            FxHashMap::default()
        };

        info!("Bonus ledger loaded from {:?}: {} entries", path, entries.len());

        Ok(Self {
            path,
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
            _lock: lock,
        })
    }

    /// Location of the durable file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bonus for a user, 0 if none.
    pub fn get(&self, user: UserId) -> u64 {
        self.entries.read().get(&user).copied().unwrap_or(0)
    }

    /// Set a user's bonus. Negative amounts are rejected.
    pub fn set(&self, user: UserId, amount: i64) -> Result<u64> {
        let amount = u64::try_from(amount).map_err(|_| {
            Error::Validation(format!("bonus cannot be negative (got {})", amount))
        })?;
        let _writer = self.writer.lock();
        self.commit(user, amount)?;
        Ok(amount)
    }

    /// Add to a user's bonus and return the new value.
    pub fn add(&self, user: UserId, delta: u64) -> Result<u64> {
        let _writer = self.writer.lock();
        let next = self
            .get(user)
            .checked_add(delta)
            .ok_or_else(|| Error::Validation(format!("bonus for {} would overflow", user)))?;
        self.commit(user, next)?;
        Ok(next)
    }

    /// Snapshot of all non-zero entries.
    pub fn list_all(&self) -> FxHashMap<UserId, u64> {
        self.entries.read().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Write the would-be state to disk, then adopt it in memory.
    ///
    /// Callers hold the writer lock, so the map cannot change between the
    /// snapshot and the swap.
    fn commit(&self, user: UserId, value: u64) -> Result<()> {
        let mut next = self.entries.read().clone();
        if value == 0 {
            next.remove(&user);
        } else {
            next.insert(user, value);
        }

        let mut records: Vec<LedgerRecord> = next
            .iter()
            .map(|(id, bonus)| LedgerRecord {
                user: id.as_u128(),
                bonus: *bonus,
            })
            .collect();
        records.sort_unstable_by_key(|r| r.user);

        if let Err(e) = write_ledger(&self.path, &records) {
            METRICS.inc(&METRICS.ledger_write_failures);
            error!("Failed to save bonus ledger {:?}: {}", self.path, e);
            return Err(Error::Persistence(format!(
                "cannot write ledger {:?}: {}",
                self.path, e
            )));
        }

        METRICS.inc(&METRICS.ledger_writes);
        *self.entries.write() = next;
        Ok(())
    }
}

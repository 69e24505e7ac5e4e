mod config;
mod ledger_file;
mod lock;

pub use config::{PersistenceConfig, LEDGER_FILE_NAME, LOCK_FILE_NAME};
pub use ledger_file::{
    read_ledger, write_ledger, LedgerHeader, LedgerRecord, LoadedLedger, LEDGER_MAGIC,
    LEDGER_VERSION,
};
pub use lock::lock_exclusive;

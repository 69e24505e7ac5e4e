use std::path::PathBuf;

/// File name of the ledger inside the data directory.
pub const LEDGER_FILE_NAME: &str = "bonus_ledger.bin";

/// File name of the advisory lock guarding the data directory.
pub const LOCK_FILE_NAME: &str = "bonus_ledger.lock";

/// Configuration for the ledger's durable store.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Data directory (default: "./data")
    pub data_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl PersistenceConfig {
    /// Create a config rooted at the given directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Get the path of the ledger file.
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE_NAME)
    }

    /// Get the path of the data directory lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(LOCK_FILE_NAME)
    }
}

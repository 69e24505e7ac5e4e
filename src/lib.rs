pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod persistence;
pub mod types;

pub use backend::{MemoryBackend, PermissionBackend, SessionDirectory, Subscription};
pub use config::Config;
pub use engine::{BonusLedger, EngineConfig, QuotaSync, TopologyChange, TopologyListener};
pub use error::{Error, Result};
pub use types::{PermissionNode, QuotaPrefix, UserId};

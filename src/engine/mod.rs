mod events;
mod fanout;
mod ledger;
mod reconciler;
mod resolver;
mod scheduler;
mod sync;

pub use events::{classify, ChangeKind, EntityRef, TopologyChange, TopologyListener, Trigger};
pub use fanout::fan_out;
pub use ledger::BonusLedger;
pub use reconciler::{plan_quota_mutation, Reconciler, ReconcilerConfig, Reconciliation};
pub use resolver::{group_limit, resolve_limit};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle};
pub use sync::{EngineConfig, QuotaSync};

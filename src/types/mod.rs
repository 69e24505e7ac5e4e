mod node;
mod user_id;

pub use node::{NodeKind, PermissionNode, QuotaPrefix, DEFAULT_QUOTA_PREFIX, INHERITANCE_PREFIX};
pub use user_id::UserId;

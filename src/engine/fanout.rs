//! Group-level quota changes propagated to resident members.
//!
//! Only users currently loaded are visited. Offline members pick up the new
//! value on their next join.

use tracing::{info, warn};

use crate::backend::{PermissionBackend, SessionDirectory};
use crate::engine::scheduler::SchedulerHandle;
use crate::metrics::METRICS;

/// Schedule a reconciliation for every resident user whose primary group is
/// `group` or whose inherited closure contains it. Returns how many were
/// scheduled.
pub async fn fan_out<B>(backend: &B, group: &str, scheduler: &SchedulerHandle) -> usize
where
    B: PermissionBackend + SessionDirectory,
{
    METRICS.inc(&METRICS.fanout_runs);
    let mut scheduled = 0;

    for user in backend.resident_users() {
        let Some(name) = user.username.as_deref().filter(|n| !n.is_empty()) else {
            continue;
        };

        let member = user.primary_group == group
            || match backend.inherited_groups(user.id).await {
                Ok(groups) => groups.iter().any(|g| g.name == group),
                Err(e) => {
                    warn!("Fan-out for group {}: skipping {}: {}", group, name, e);
                    false
                }
            };

        if member && scheduler.schedule(user.id, name.to_string()) {
            scheduled += 1;
        }
    }

    METRICS.add(&METRICS.fanout_users, scheduled as u64);
    info!(
        "Group {} quota changed, scheduled {} resident members",
        group, scheduled
    );
    scheduled
}

//! Group-derived quota resolution.
//!
//! Only group nodes are read here. A user's own nodes include the quota node
//! this crate writes, so reading them would feed every result back into the
//! next computation.

use tracing::debug;

use crate::backend::GroupView;
use crate::types::QuotaPrefix;

/// Highest quota granted by a single group's own nodes, or 0.
pub fn group_limit(prefix: &QuotaPrefix, group: &GroupView) -> u64 {
    let mut limit = 0;
    for node in &group.nodes {
        match prefix.granted_value(node) {
            Some(Ok(value)) => limit = limit.max(value),
            Some(Err(e)) => debug!("Group {}: skipping node: {}", group.name, e),
            None => {}
        }
    }
    limit
}

/// Maximum quota advertised by the primary group and the inherited closure.
///
/// `inherited` is the backend's pre-resolved closure; parents are never
/// followed here. A missing primary group contributes nothing.
pub fn resolve_limit(
    prefix: &QuotaPrefix,
    primary: Option<&GroupView>,
    inherited: &[GroupView],
) -> u64 {
    primary
        .into_iter()
        .chain(inherited.iter())
        .map(|group| group_limit(prefix, group))
        .max()
        .unwrap_or(0)
}

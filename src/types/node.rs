use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Key prefix of nodes that make a holder inherit from a group
/// (`group.<name>`).
pub const INHERITANCE_PREFIX: &str = "group.";

/// Quota prefix used when none is configured.
pub const DEFAULT_QUOTA_PREFIX: &str = "axplayerwarps.warps.";

/// Broad classification of a permission node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// `group.<name>`: grants inheritance from another group
    Inheritance,
    /// Any other permission
    Permission,
}

/// A single permission entry: a key and a boolean value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PermissionNode {
    key: String,
    value: bool,
}

impl PermissionNode {
    /// Create a node with an explicit value
    pub fn new(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Create a node with value=true
    pub fn granted(key: impl Into<String>) -> Self {
        Self::new(key, true)
    }

    /// Create an inheritance node for a group
    pub fn inherits(group: &str) -> Self {
        Self::granted(format!("{}{}", INHERITANCE_PREFIX, group))
    }

    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> bool {
        self.value
    }

    pub fn kind(&self) -> NodeKind {
        if self.key.starts_with(INHERITANCE_PREFIX) {
            NodeKind::Inheritance
        } else {
            NodeKind::Permission
        }
    }

    /// Name of the inherited group, for inheritance nodes.
    pub fn inherited_group(&self) -> Option<&str> {
        self.key.strip_prefix(INHERITANCE_PREFIX)
    }
}

impl fmt::Display for PermissionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// The reserved key prefix that marks quota nodes.
///
/// A quota node key is the prefix followed by a non-negative decimal integer,
/// e.g. `axplayerwarps.warps.5`. Cheap to clone.
#[derive(Clone, PartialEq, Eq)]
pub struct QuotaPrefix(Arc<str>);

impl QuotaPrefix {
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self(Arc::from(prefix.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether a key carries the quota prefix (regardless of its suffix).
    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        key.starts_with(&*self.0)
    }

    /// Parse the quota value out of a prefixed key.
    ///
    /// Only plain ASCII digits are accepted; signs, whitespace, an empty
    /// suffix or a value overflowing u64 yield `MalformedNodeKey`.
    pub fn parse_suffix(&self, key: &str) -> Result<u64> {
        let suffix = key
            .strip_prefix(&*self.0)
            .ok_or_else(|| Error::MalformedNodeKey(key.to_string()))?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::MalformedNodeKey(key.to_string()));
        }
        suffix
            .parse::<u64>()
            .map_err(|_| Error::MalformedNodeKey(key.to_string()))
    }

    /// Quota value granted by a node: `None` unless the node is prefixed and
    /// set to true.
    pub fn granted_value(&self, node: &PermissionNode) -> Option<Result<u64>> {
        if node.value() && self.matches(node.key()) {
            Some(self.parse_suffix(node.key()))
        } else {
            None
        }
    }

    /// Build the canonical node for a quota total.
    pub fn node_for(&self, total: u64) -> PermissionNode {
        PermissionNode::granted(format!("{}{}", self.0, total))
    }
}

impl Default for QuotaPrefix {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_PREFIX)
    }
}

impl fmt::Debug for QuotaPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuotaPrefix({:?})", &*self.0)
    }
}

impl fmt::Display for QuotaPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;

use uuid::Uuid;

/// Stable identifier for a user.
///
/// Wraps a 128-bit UUID. Display names can change; the id never does, so it
/// is the only thing used as a ledger or lock key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct UserId(Uuid);

impl UserId {
    /// Create a UserId from a UUID
    #[inline]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Generate a random (v4) UserId
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild a UserId from its 128-bit integer form
    #[inline]
    pub const fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }

    /// Get the 128-bit integer form (used by the ledger file)
    #[inline]
    pub const fn as_u128(&self) -> u128 {
        self.0.as_u128()
    }

    /// Get the underlying UUID
    #[inline]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserId({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self::new(id)
    }
}

impl From<UserId> for Uuid {
    fn from(id: UserId) -> Self {
        id.0
    }
}

use std::fmt;
use std::io;

use crate::types::UserId;

/// Unified error type for quota synchronization
#[derive(Debug)]
pub enum Error {
    /// I/O error from the ledger file
    Io(io::Error),

    /// Permission backend is not present or not loaded
    BackendUnavailable,

    /// Backend could not produce a permission view for a user
    UserLoadFailure { user: UserId, reason: String },

    /// Quota-prefixed key whose suffix is not a non-negative integer
    MalformedNodeKey(String),

    /// Ledger mutation could not be made durable
    Persistence(String),

    /// Backend rejected a node mutation for a user
    NodeWrite { user: UserId, reason: String },

    /// Invalid caller input
    Validation(String),

    /// Engine has been shut down
    Disabled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::BackendUnavailable => write!(f, "Permission backend unavailable"),
            Error::UserLoadFailure { user, reason } => {
                write!(f, "Failed to load user {}: {}", user, reason)
            }
            Error::MalformedNodeKey(key) => write!(f, "Malformed quota node key: {}", key),
            Error::Persistence(msg) => write!(f, "Persistence error: {}", msg),
            Error::NodeWrite { user, reason } => {
                write!(f, "Failed to write nodes for user {}: {}", user, reason)
            }
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::Disabled => write!(f, "Quota sync is disabled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type alias for quota sync operations
pub type Result<T> = std::result::Result<T, Error>;

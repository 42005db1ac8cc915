//! Access denied error.

use crate::Permission;
use leasehold_types::{ActorId, ErrorCode};
use thiserror::Error;

/// Raised by [`AccessGuard`](crate::AccessGuard) checks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessDenied {
    /// The requester lacks the required permission.
    #[error("'{requester}' lacks {required} on guard owned by '{owner}'")]
    NotPermitted {
        requester: String,
        owner: String,
        required: Permission,
    },

    /// The requester presented a guid that does not match its registered name.
    #[error("identity mismatch for '{name}': expected {expected}, got {actual}")]
    IdentityMismatch {
        name: String,
        expected: ActorId,
        actual: ActorId,
    },
}

impl AccessDenied {
    /// Permission the request needed, if applicable.
    #[must_use]
    pub fn required(&self) -> Option<Permission> {
        match self {
            Self::NotPermitted { required, .. } => Some(*required),
            Self::IdentityMismatch { .. } => None,
        }
    }
}

impl ErrorCode for AccessDenied {
    fn code(&self) -> &'static str {
        match self {
            Self::NotPermitted { .. } => "AUTH_NOT_PERMITTED",
            Self::IdentityMismatch { .. } => "AUTH_IDENTITY_MISMATCH",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

//! Kernel error type.
//!
//! Errors here are the synchronous, validate-fail-fast kind: they reject a
//! request before any state changes. Failures that happen after a
//! reservation or delegation has started processing are recorded on the
//! object itself (state `Failed` plus a failure update) and never surface
//! as a [`KernelError`].
//!
//! | Code | Meaning |
//! |------|---------|
//! | `KERNEL_INVALID_ARGUMENT` | missing or malformed argument |
//! | `KERNEL_NOT_FOUND` | unknown slice, reservation or delegation |
//! | `KERNEL_UNAUTHORIZED` | access guard rejected the caller |
//! | `KERNEL_INVALID_STATE` | operation not allowed in the current state |
//! | `KERNEL_ALREADY_REGISTERED` | duplicate registration |
//! | `KERNEL_STORE` | persistence failed |
//! | `KERNEL_POLICY` | policy refused a synchronous request |
//! | `KERNEL_RPC` | outbound request could not be started |

use crate::policy::PolicyError;
use crate::rpc::RpcError;
use crate::store::StoreError;
use leasehold_auth::AccessDenied;
use leasehold_event::EventError;
use leasehold_types::{ErrorCode, TermError};
use thiserror::Error;

/// Kind of object a [`KernelError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Slice,
    Reservation,
    Delegation,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Slice => "slice",
            Self::Reservation => "reservation",
            Self::Delegation => "delegation",
        })
    }
}

/// Synchronous kernel failure.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: ObjectKind, id: String },

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] AccessDenied),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{kind} already registered: {id}")]
    AlreadyRegistered { kind: ObjectKind, id: String },

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
}

impl KernelError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn not_found(kind: ObjectKind, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn already_registered(kind: ObjectKind, id: impl ToString) -> Self {
        Self::AlreadyRegistered {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether this is one of the validation errors that reject a request
    /// outright (invalid argument, not found, unauthorized).
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::NotFound { .. } | Self::Unauthorized(_)
        )
    }
}

impl From<EventError> for KernelError {
    fn from(err: EventError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl From<TermError> for KernelError {
    fn from(err: TermError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

impl ErrorCode for KernelError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "KERNEL_INVALID_ARGUMENT",
            Self::NotFound { .. } => "KERNEL_NOT_FOUND",
            Self::Unauthorized(_) => "KERNEL_UNAUTHORIZED",
            Self::InvalidState(_) => "KERNEL_INVALID_STATE",
            Self::AlreadyRegistered { .. } => "KERNEL_ALREADY_REGISTERED",
            Self::Store(_) => "KERNEL_STORE",
            Self::Policy(_) => "KERNEL_POLICY",
            Self::Rpc(_) => "KERNEL_RPC",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_recoverable(),
            Self::Rpc(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

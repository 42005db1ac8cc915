//! Event error types.

use crate::RpcRequestType;
use leasehold_types::ErrorCode;
use thiserror::Error;

/// Malformed RPC message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    /// The payload variant does not match what the request type needs.
    #[error("{kind} message carries a {found} payload, expected {expected}")]
    UnexpectedPayload {
        kind: RpcRequestType,
        expected: &'static str,
        found: &'static str,
    },

    /// A required field is absent.
    #[error("{kind} message is missing {field}")]
    MissingField {
        kind: RpcRequestType,
        field: &'static str,
    },
}

impl ErrorCode for EventError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnexpectedPayload { .. } => "EVENT_UNEXPECTED_PAYLOAD",
            Self::MissingField { .. } => "EVENT_MISSING_FIELD",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

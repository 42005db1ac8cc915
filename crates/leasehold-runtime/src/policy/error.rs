//! Policy error type.
//!
//! A policy error raised inside a transition never escapes the kernel:
//! the reservation or delegation is failed and the peer is notified.
//! Only synchronous calls such as `demand` return it to the caller.

use leasehold_types::{ErrorCode, ResourceType, TermError};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The installed policy does not serve this actor role.
    #[error("policy has no {0} capability")]
    MissingCapability(&'static str),

    #[error("unknown resource type: {0}")]
    UnknownResourceType(ResourceType),

    #[error("insufficient {rtype}: requested {requested}, available {available}")]
    Insufficient {
        rtype: ResourceType,
        requested: u32,
        available: u32,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),

    #[error("invalid delegation graph: {0}")]
    InvalidGraph(String),

    #[error("rejected by operator: {0}")]
    Rejected(String),

    #[error(transparent)]
    Term(#[from] TermError),
}

impl PolicyError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_ticket(message: impl Into<String>) -> Self {
        Self::InvalidTicket(message.into())
    }

    pub fn insufficient(rtype: &ResourceType, requested: u32, available: u32) -> Self {
        Self::Insufficient {
            rtype: rtype.clone(),
            requested,
            available,
        }
    }
}

impl ErrorCode for PolicyError {
    fn code(&self) -> &'static str {
        match self {
            Self::MissingCapability(_) => "POLICY_MISSING_CAPABILITY",
            Self::UnknownResourceType(_) => "POLICY_UNKNOWN_RESOURCE_TYPE",
            Self::Insufficient { .. } => "POLICY_INSUFFICIENT",
            Self::InvalidRequest(_) => "POLICY_INVALID_REQUEST",
            Self::InvalidTicket(_) => "POLICY_INVALID_TICKET",
            Self::InvalidGraph(_) => "POLICY_INVALID_GRAPH",
            Self::Rejected(_) => "POLICY_REJECTED",
            Self::Term(_) => "POLICY_TERM",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Insufficient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use leasehold_types::{assert_error_codes, Term};

    #[test]
    fn codes() {
        let now = Utc::now();
        let term_err = Term::new(now, now - Duration::seconds(1)).unwrap_err();
        assert_error_codes(
            &[
                PolicyError::MissingCapability("broker"),
                PolicyError::UnknownResourceType("vm".into()),
                PolicyError::insufficient(&"vm".into(), 5, 2),
                PolicyError::invalid_request("x"),
                PolicyError::invalid_ticket("x"),
                PolicyError::InvalidGraph("x".into()),
                PolicyError::Rejected("no".into()),
                PolicyError::Term(term_err),
            ],
            "POLICY_",
        );
    }

    #[test]
    fn display() {
        let err = PolicyError::insufficient(&"vm".into(), 5, 2);
        assert_eq!(err.to_string(), "insufficient vm: requested 5, available 2");
    }
}

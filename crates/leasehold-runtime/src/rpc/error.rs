//! RPC layer errors.
//!
//! # Error Codes
//!
//! | Variant | Code | Recoverable |
//! |---------|------|-------------|
//! | [`RpcError::UnknownPeer`] | `RPC_UNKNOWN_PEER` | No |
//! | [`RpcError::NoRuntime`] | `RPC_NO_RUNTIME` | No |
//! | [`RpcError::Transport`] | `RPC_TRANSPORT_*` | Depends |
//! | [`RpcError::Timeout`] | `RPC_TIMEOUT` | Yes |
//!
//! Only [`RpcError`] can reach a caller synchronously, and only from
//! `enqueue`. A [`TransportError`] raised while a request executes is
//! turned into a `FailedRpc` event instead.

use leasehold_types::{ActorId, ErrorCode, MessageId};
use thiserror::Error;

/// Failure reported by a [`Proxy`](super::Proxy).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer has shut down for good.
    #[error("peer {0} is closed")]
    Closed(ActorId),

    /// The peer could not be reached right now.
    #[error("peer {0} is unreachable")]
    Unreachable(ActorId),

    /// The transport refused the message.
    #[error("rejected by transport: {0}")]
    Rejected(String),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Closed(_) => "RPC_TRANSPORT_CLOSED",
            Self::Unreachable(_) => "RPC_TRANSPORT_UNREACHABLE",
            Self::Rejected(_) => "RPC_TRANSPORT_REJECTED",
        }
    }

    fn is_recoverable(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// No proxy is registered for the destination.
    #[error("no proxy for peer {0}")]
    UnknownPeer(ActorId),

    /// `enqueue` was called outside a tokio runtime.
    #[error("no async runtime to execute requests")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request {0} timed out")]
    Timeout(MessageId),
}

impl ErrorCode for RpcError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnknownPeer(_) => "RPC_UNKNOWN_PEER",
            Self::NoRuntime => "RPC_NO_RUNTIME",
            Self::Transport(e) => e.code(),
            Self::Timeout(_) => "RPC_TIMEOUT",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_recoverable(),
            Self::Timeout(_) => true,
            Self::UnknownPeer(_) | Self::NoRuntime => false,
        }
    }
}

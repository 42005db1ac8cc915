//! Outbound request envelope.

use leasehold_event::{RpcMessage, RpcRequestType};
use leasehold_types::{ActorId, MessageId};
use std::fmt;

/// A message on its way to `to`, with the number of times it was retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub message: RpcMessage,
    pub to: ActorId,
    pub retry_count: u32,
}

impl RpcRequest {
    #[must_use]
    pub fn new(to: ActorId, message: RpcMessage) -> Self {
        Self {
            message,
            to,
            retry_count: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> MessageId {
        self.message.message_id
    }

    #[must_use]
    pub fn kind(&self) -> RpcRequestType {
        self.message.kind
    }

    /// Same request, one more attempt.
    #[must_use]
    pub fn retried(mut self) -> Self {
        self.retry_count += 1;
        self
    }
}

impl fmt::Display for RpcRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}", self.message, self.to)?;
        if self.retry_count > 0 {
            write!(f, " (retry {})", self.retry_count)?;
        }
        Ok(())
    }
}

//! Operation context handed to state machine transitions.
//!
//! State machines never talk to the RPC manager directly. They queue
//! [`Outbound`] messages on an [`Outbox`]; the kernel persists every dirty
//! record first and only then flushes the outbox, so a peer never sees an
//! update for a state that was not durably recorded.

use crate::actor::ActorClock;
use crate::policy::Policy;
use leasehold_event::{RpcMessage, RpcPayload, RpcRequestType};
use leasehold_types::{ActorId, AuthToken, MessageId};
use std::collections::VecDeque;

/// A message queued by a state machine, not yet handed to the RPC manager.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub kind: RpcRequestType,
    pub to: ActorId,
    pub sequence: u64,
    pub payload: RpcPayload,
    /// Request this message answers, for responses to claims.
    pub reply_to: Option<MessageId>,
}

impl Outbound {
    #[must_use]
    pub fn new(kind: RpcRequestType, to: ActorId, sequence: u64, payload: RpcPayload) -> Self {
        Self {
            kind,
            to,
            sequence,
            payload,
            reply_to: None,
        }
    }

    #[must_use]
    pub fn in_reply_to(mut self, request: Option<MessageId>) -> Self {
        self.reply_to = request;
        self
    }

    /// Builds the wire message sent by `caller`.
    #[must_use]
    pub fn into_message(self, caller: &AuthToken) -> RpcMessage {
        let mut message = RpcMessage::new(self.kind, caller.clone(), self.payload)
            .with_sequence(self.sequence)
            .with_callback(caller.guid);
        message.request_id = self.reply_to;
        message
    }
}

/// FIFO of messages awaiting a successful commit.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<Outbound>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, outbound: Outbound) {
        self.queue.push_back(outbound);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Outbound> {
        self.queue.iter()
    }

    /// Removes and returns everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.queue.drain(..).collect()
    }
}

/// Collaborators a transition may use.
pub struct OpContext<'a> {
    pub policy: &'a mut dyn Policy,
    pub outbox: &'a mut Outbox,
    pub clock: &'a ActorClock,
    pub identity: &'a AuthToken,
    pub cycle: u64,
}

impl OpContext<'_> {
    pub fn send(&mut self, outbound: Outbound) {
        self.outbox.push(outbound);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::ReservationId;
    use std::collections::BTreeMap;

    #[test]
    fn outbox_is_fifo() {
        let mut outbox = Outbox::new();
        let peer = ActorId::named("broker");
        for seq in 1..=3 {
            outbox.push(Outbound::new(
                RpcRequestType::Query,
                peer,
                seq,
                RpcPayload::Query(BTreeMap::new()),
            ));
        }
        let seqs: Vec<u64> = outbox.drain().iter().map(|o| o.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn into_message_carries_sequence_and_reply() {
        let me = AuthToken::named("broker");
        let request = MessageId::new();
        let msg = Outbound::new(
            RpcRequestType::UpdateTicket,
            ActorId::named("ctl"),
            7,
            RpcPayload::Query(BTreeMap::new()),
        )
        .in_reply_to(Some(request))
        .into_message(&me);

        assert_eq!(msg.sequence, 7);
        assert_eq!(msg.request_id, Some(request));
        assert_eq!(msg.callback, Some(me.guid));
        assert_eq!(msg.caller, me);
        assert_eq!(msg.reservation_id(), None::<ReservationId>);
    }
}

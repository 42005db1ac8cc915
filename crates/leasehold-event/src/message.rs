//! RPC messages.
//!
//! The transport layer is out of scope; an [`RpcMessage`] is the
//! in-process representation handed to a proxy. Every message carries
//! the caller's identity, the id of the actor that should receive
//! responses, and the per-reservation (or per-delegation) sequence number
//! the receiver arbitrates on.

use crate::{EventError, RpcRequestType, UpdateData};
use chrono::{DateTime, Utc};
use leasehold_types::{
    ActorId, AuthToken, DelegationId, MessageId, ReservationId, ResourceSet, SliceId, Term,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reservation state as exchanged between actors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationWire {
    pub reservation_id: ReservationId,
    pub slice_id: SliceId,
    pub slice_name: String,
    /// Requested term on requests, granted term on updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<Term>,
    pub resources: ResourceSet,
    #[serde(default)]
    pub renewable: bool,
    /// Set by the sender when the reservation has been closed on its side.
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub update: UpdateData,
}

/// Delegation state as exchanged between actors.
///
/// `graph` is an opaque resource descriptor; only policies interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationWire {
    pub delegation_id: DelegationId,
    pub name: String,
    pub slice_id: SliceId,
    pub slice_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<String>,
    #[serde(default)]
    pub update: UpdateData,
}

/// Why an outbound request did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// No response arrived before the request's deadline.
    Timeout,
    /// The transport could not deliver the message.
    Transport,
    /// The receiver rejected the request during validation.
    Rejected,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failure notice, either synthesized locally or received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFailure {
    pub kind: FailureKind,
    /// Type of the request that failed.
    pub request_type: RpcRequestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation_id: Option<DelegationId>,
    /// Error code of the underlying error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
}

impl RpcFailure {
    /// Builds a failure notice about a request.
    #[must_use]
    pub fn new(kind: FailureKind, request: &RpcMessage, message: impl Into<String>) -> Self {
        Self {
            kind,
            request_type: request.kind,
            reservation_id: request.reservation_id(),
            delegation_id: request.delegation_id(),
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RpcPayload {
    Reservation(ReservationWire),
    Delegation(DelegationWire),
    Query(BTreeMap<String, String>),
    QueryResult(BTreeMap<String, String>),
    Failed(RpcFailure),
}

impl RpcPayload {
    /// Short name used in error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reservation(_) => "reservation",
            Self::Delegation(_) => "delegation",
            Self::Query(_) => "query",
            Self::QueryResult(_) => "query_result",
            Self::Failed(_) => "failed",
        }
    }
}

/// A single RPC.
///
/// # Example
///
/// ```
/// use leasehold_event::{RpcMessage, RpcPayload, RpcRequestType};
/// use leasehold_types::{ActorId, AuthToken};
/// use std::collections::BTreeMap;
///
/// let me = AuthToken::named("controller");
/// let query = RpcMessage::new(RpcRequestType::Query, me.clone(), RpcPayload::Query(BTreeMap::new()))
///     .with_callback(me.guid);
///
/// let answer = query.reply(
///     RpcRequestType::QueryResult,
///     AuthToken::named("broker"),
///     RpcPayload::QueryResult(BTreeMap::new()),
/// );
/// assert_eq!(answer.request_id, Some(query.message_id));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub message_id: MessageId,
    /// Id of the request this message answers, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<MessageId>,
    pub kind: RpcRequestType,
    pub caller: AuthToken,
    /// Actor that should receive responses and updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<ActorId>,
    #[serde(default)]
    pub sequence: u64,
    pub payload: RpcPayload,
    pub sent_at: DateTime<Utc>,
}

impl RpcMessage {
    #[must_use]
    pub fn new(kind: RpcRequestType, caller: AuthToken, payload: RpcPayload) -> Self {
        Self {
            message_id: MessageId::new(),
            request_id: None,
            kind,
            caller,
            callback: None,
            sequence: 0,
            payload,
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    #[must_use]
    pub fn with_callback(mut self, callback: ActorId) -> Self {
        self.callback = Some(callback);
        self
    }

    #[must_use]
    pub fn in_reply_to(mut self, request_id: MessageId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Builds a response addressed to this message.
    #[must_use]
    pub fn reply(&self, kind: RpcRequestType, caller: AuthToken, payload: RpcPayload) -> Self {
        let callback = caller.guid;
        Self::new(kind, caller, payload)
            .in_reply_to(self.message_id)
            .with_callback(callback)
    }

    /// Builds a `FailedRpc` notice answering this message.
    #[must_use]
    pub fn reject(&self, caller: AuthToken, failure: RpcFailure) -> Self {
        self.reply(RpcRequestType::FailedRpc, caller, RpcPayload::Failed(failure))
    }

    /// Actor responses should go to: the callback, or the caller.
    #[must_use]
    pub fn reply_target(&self) -> ActorId {
        self.callback.unwrap_or(self.caller.guid)
    }

    /// Reservation payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnexpectedPayload`] for any other payload.
    pub fn reservation(&self) -> Result<&ReservationWire, EventError> {
        match &self.payload {
            RpcPayload::Reservation(r) => Ok(r),
            other => Err(self.unexpected("reservation", other)),
        }
    }

    /// Delegation payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnexpectedPayload`] for any other payload.
    pub fn delegation(&self) -> Result<&DelegationWire, EventError> {
        match &self.payload {
            RpcPayload::Delegation(d) => Ok(d),
            other => Err(self.unexpected("delegation", other)),
        }
    }

    /// Failure payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnexpectedPayload`] for any other payload.
    pub fn failure(&self) -> Result<&RpcFailure, EventError> {
        match &self.payload {
            RpcPayload::Failed(f) => Ok(f),
            other => Err(self.unexpected("failed", other)),
        }
    }

    /// Query or query-result properties.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::UnexpectedPayload`] for any other payload.
    pub fn properties(&self) -> Result<&BTreeMap<String, String>, EventError> {
        match &self.payload {
            RpcPayload::Query(p) | RpcPayload::QueryResult(p) => Ok(p),
            other => Err(self.unexpected("query", other)),
        }
    }

    /// Callback id, required on requests that produce updates.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::MissingField`] if absent.
    pub fn require_callback(&self) -> Result<ActorId, EventError> {
        self.callback.ok_or(EventError::MissingField {
            kind: self.kind,
            field: "callback",
        })
    }

    #[must_use]
    pub fn reservation_id(&self) -> Option<ReservationId> {
        match &self.payload {
            RpcPayload::Reservation(r) => Some(r.reservation_id),
            RpcPayload::Failed(f) => f.reservation_id,
            _ => None,
        }
    }

    #[must_use]
    pub fn delegation_id(&self) -> Option<DelegationId> {
        match &self.payload {
            RpcPayload::Delegation(d) => Some(d.delegation_id),
            RpcPayload::Failed(f) => f.delegation_id,
            _ => None,
        }
    }

    fn unexpected(&self, expected: &'static str, found: &RpcPayload) -> EventError {
        EventError::UnexpectedPayload {
            kind: self.kind,
            expected,
            found: found.name(),
        }
    }
}

impl fmt::Display for RpcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} from {} seq={}",
            self.kind, self.message_id, self.caller.name, self.sequence
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::ResourceSet;

    fn wire() -> ReservationWire {
        ReservationWire {
            reservation_id: ReservationId::new(),
            slice_id: SliceId::new(),
            slice_name: "demo".into(),
            term: None,
            resources: ResourceSet::new(2, "vm"),
            renewable: false,
            closed: false,
            update: UpdateData::default(),
        }
    }

    #[test]
    fn accessors_check_payload_variant() {
        let msg = RpcMessage::new(
            RpcRequestType::Ticket,
            AuthToken::named("c"),
            RpcPayload::Reservation(wire()),
        );
        assert!(msg.reservation().is_ok());
        let err = msg.delegation().unwrap_err();
        assert!(matches!(
            err,
            EventError::UnexpectedPayload {
                expected: "delegation",
                found: "reservation",
                ..
            }
        ));
    }

    #[test]
    fn reply_target_prefers_callback() {
        let caller = AuthToken::named("c");
        let other = ActorId::named("elsewhere");
        let msg = RpcMessage::new(RpcRequestType::Ticket, caller.clone(), RpcPayload::Reservation(wire()));
        assert_eq!(msg.reply_target(), caller.guid);
        assert_eq!(msg.clone().with_callback(other).reply_target(), other);
        assert!(msg.require_callback().is_err());
    }

    #[test]
    fn reject_carries_ids() {
        let msg = RpcMessage::new(
            RpcRequestType::Redeem,
            AuthToken::named("c"),
            RpcPayload::Reservation(wire()),
        )
        .with_sequence(4);
        let failure = RpcFailure::new(FailureKind::Rejected, &msg, "no such slice").with_code("KERNEL_NOT_FOUND");
        let notice = msg.reject(AuthToken::named("site"), failure);

        assert_eq!(notice.kind, RpcRequestType::FailedRpc);
        assert_eq!(notice.request_id, Some(msg.message_id));
        assert_eq!(notice.reservation_id(), msg.reservation_id());
        let f = notice.failure().unwrap();
        assert_eq!(f.request_type, RpcRequestType::Redeem);
        assert_eq!(f.code.as_deref(), Some("KERNEL_NOT_FOUND"));
    }

    #[test]
    fn payload_serializes_with_tag() {
        let msg = RpcMessage::new(
            RpcRequestType::Query,
            AuthToken::named("c"),
            RpcPayload::Query(BTreeMap::from([("kind".to_string(), "stats".to_string())])),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["payload"]["type"], "query");
        assert_eq!(json["payload"]["body"]["kind"], "stats");
    }
}

//! Persistent reservation state.

use leasehold_event::{ReservationWire, UpdateData};
use leasehold_types::{
    ActorId, MessageId, ReservationId, ReservationPendingState, ReservationState, ResourceSet,
    SliceId, Term,
};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the protocol a reservation lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationRole {
    /// Controller side: requests tickets and leases.
    Client,
    /// Broker side: issues tickets.
    Broker,
    /// Authority side: issues leases.
    Authority,
}

impl fmt::Display for ReservationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Broker => "broker",
            Self::Authority => "authority",
        })
    }
}

/// Plain data for one reservation, as written to the store.
///
/// Runtime behaviour lives in [`Reservation`](super::Reservation), rebuilt
/// from this record with [`Reservation::restore`](super::Reservation::restore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub reservation_id: ReservationId,
    pub slice_id: SliceId,
    pub slice_name: String,
    pub role: ReservationRole,

    pub state: ReservationState,
    pub pending: ReservationPendingState,

    /// The policy has not decided yet.
    #[serde(default)]
    pub bid_pending: bool,
    #[serde(default)]
    pub renewable: bool,
    /// Created on behalf of a peer that will claim it later.
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub closed_in_priming: bool,
    #[serde(default)]
    pub notified_failed: bool,
    #[serde(default)]
    pub pending_recover: bool,
    /// An update is owed to the callback.
    #[serde(default)]
    pub update_pending: bool,

    #[serde(default)]
    pub requested_term: Option<Term>,
    #[serde(default)]
    pub approved_term: Option<Term>,
    #[serde(default)]
    pub term: Option<Term>,
    #[serde(default)]
    pub previous_term: Option<Term>,

    pub requested_resources: ResourceSet,
    #[serde(default)]
    pub approved_resources: Option<ResourceSet>,
    #[serde(default)]
    pub resources: Option<ResourceSet>,
    #[serde(default)]
    pub previous_resources: Option<ResourceSet>,

    /// Broker channel on the client, the only channel on servers.
    #[serde(default)]
    pub sequence_in: u64,
    #[serde(default)]
    pub sequence_out: u64,
    /// Authority channel on the client.
    #[serde(default)]
    pub lease_sequence_in: u64,
    #[serde(default)]
    pub lease_sequence_out: u64,

    #[serde(default)]
    pub broker: Option<ActorId>,
    #[serde(default)]
    pub authority: Option<ActorId>,
    /// Where updates go (server side).
    #[serde(default)]
    pub callback: Option<ActorId>,

    #[serde(default)]
    pub update: UpdateData,
    /// Claim request still waiting for its answer.
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

impl ReservationRecord {
    #[must_use]
    pub fn new(
        role: ReservationRole,
        slice_id: SliceId,
        slice_name: impl Into<String>,
        requested_resources: ResourceSet,
        requested_term: Option<Term>,
    ) -> Self {
        Self::with_id(
            ReservationId::new(),
            role,
            slice_id,
            slice_name,
            requested_resources,
            requested_term,
        )
    }

    #[must_use]
    pub fn with_id(
        reservation_id: ReservationId,
        role: ReservationRole,
        slice_id: SliceId,
        slice_name: impl Into<String>,
        requested_resources: ResourceSet,
        requested_term: Option<Term>,
    ) -> Self {
        Self {
            reservation_id,
            slice_id,
            slice_name: slice_name.into(),
            role,
            state: ReservationState::Nascent,
            pending: ReservationPendingState::None,
            bid_pending: false,
            renewable: false,
            exported: false,
            closed_in_priming: false,
            notified_failed: false,
            pending_recover: false,
            update_pending: false,
            requested_term,
            approved_term: None,
            term: None,
            previous_term: None,
            requested_resources,
            approved_resources: None,
            resources: None,
            previous_resources: None,
            sequence_in: 0,
            sequence_out: 0,
            lease_sequence_in: 0,
            lease_sequence_out: 0,
            broker: None,
            authority: None,
            callback: None,
            update: UpdateData::default(),
            reply_to: None,
        }
    }

    /// Server-side record for a reservation first seen on an inbound request.
    #[must_use]
    pub fn from_wire(role: ReservationRole, wire: &ReservationWire) -> Self {
        let mut record = Self::with_id(
            wire.reservation_id,
            role,
            wire.slice_id,
            wire.slice_name.clone(),
            wire.resources.clone(),
            wire.term,
        );
        record.renewable = wire.renewable;
        record
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Terminal with nothing in flight.
    #[must_use]
    pub fn is_removable(&self) -> bool {
        self.is_terminal() && self.pending.is_none()
    }

    /// Units currently held, zero before the first allocation.
    #[must_use]
    pub fn units(&self) -> u32 {
        self.resources.as_ref().map_or(0, |r| r.units)
    }
}

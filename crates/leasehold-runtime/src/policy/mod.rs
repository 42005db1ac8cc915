//! Allocation policies.
//!
//! The kernel owns ordering and validity; a policy owns allocation
//! decisions. Every actor installs exactly one [`Policy`]. Role-specific
//! behaviour is reached through capability accessors instead of type
//! checks:
//!
//! ```text
//!                     ┌──────────────┐
//!                     │    Policy    │  close, release, get_closing, query...
//!                     └──────┬───────┘
//!          as_client_mut     │ as_broker_mut       as_authority_mut
//!        ┌───────────────────┼───────────────────────┐
//!        ▼                   ▼                       ▼
//! ┌──────────────┐   ┌──────────────┐       ┌─────────────────┐
//! │ ClientPolicy │   │ BrokerPolicy │       │ AuthorityPolicy │
//! │ formulate_   │   │ bind, extend │       │ bind, extend,   │
//! │ bids, redeem │   │ allocate     │       │ bind_delegation │
//! └──────────────┘   └──────────────┘       └─────────────────┘
//! ```
//!
//! # Deferred decisions
//!
//! `bind` and `extend_*` return `Ok(true)` after calling
//! [`ReservationCore::approve`], or `Ok(false)` to decide later. Deferred
//! decisions come back from `allocate(cycle)` as [`AllocationDecision`]s;
//! the kernel applies them and the next probe completes the request.

mod authority;
mod broker;
mod client;
mod error;

pub use authority::UnitAuthorityPolicy;
pub use broker::{ApprovalQueue, ApprovalVerdict, PendingApproval, UnitBrokerPolicy};
pub use client::SimpleClientPolicy;
pub use error::PolicyError;

use crate::actor::ActorClock;
use crate::delegation::DelegationRecord;
use crate::reservation::{ReservationCore, ReservationRecord};
use leasehold_types::{ReservationId, ResourceSet, ResourceType, Term};
use std::collections::BTreeMap;

/// Behaviour shared by every role.
///
/// All hooks have no-op defaults so a policy only implements what its
/// role needs.
pub trait Policy: Send {
    fn name(&self) -> &'static str;

    /// Called at the start of every tick.
    fn prepare(&mut self, _cycle: u64) {}

    /// Called at the end of every tick.
    fn finish(&mut self, _cycle: u64) {}

    /// A reservation was closed. Use
    /// [`ReservationCore::resources_for_release`] to learn what to free.
    fn close(&mut self, _reservation: &ReservationCore) {}

    /// A reservation was relinquished by its holder.
    fn release(&mut self, _reservation: &ReservationCore) {}

    fn closed_delegation(&mut self, _delegation: &DelegationRecord) {}

    /// A delegation granted to this actor arrived with its graph.
    fn donate_delegation(&mut self, _delegation: &DelegationRecord) -> Result<(), PolicyError> {
        Ok(())
    }

    /// A delegation update finished processing (graph received or reclaimed).
    fn update_delegation_complete(&mut self, _delegation: &DelegationRecord) {}

    /// Reservations whose term ends before `cycle` and should be closed.
    fn get_closing(&mut self, _cycle: u64, _clock: &ActorClock) -> Vec<ReservationId> {
        Vec::new()
    }

    /// Rebuilds policy state for a reservation loaded during recovery.
    fn revisit(&mut self, _reservation: &ReservationRecord) {}

    fn revisit_delegation(&mut self, _delegation: &DelegationRecord) {}

    /// Key/value statistics for management queries.
    fn query(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn as_client_mut(&mut self) -> Option<&mut dyn ClientPolicy> {
        None
    }

    fn as_broker_mut(&mut self) -> Option<&mut dyn BrokerPolicy> {
        None
    }

    fn as_authority_mut(&mut self) -> Option<&mut dyn AuthorityPolicy> {
        None
    }
}

/// Reservations the client wants tickets for this cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bids {
    /// New reservations to ticket.
    pub ticketing: Vec<ReservationId>,
    /// Held reservations to extend, with the proposed term.
    pub extending: Vec<(ReservationId, Term)>,
}

impl Bids {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticketing.is_empty() && self.extending.is_empty()
    }
}

pub trait ClientPolicy: Policy {
    /// Registers interest in a newly created reservation.
    fn demand(&mut self, reservation: &ReservationRecord) -> Result<(), PolicyError>;

    fn formulate_bids(&mut self, cycle: u64, clock: &ActorClock) -> Bids;

    /// Ticketed reservations to redeem now. An `ActiveTicketed` entry means
    /// "extend the lease".
    fn get_redeeming(&mut self, cycle: u64, clock: &ActorClock) -> Vec<ReservationId>;

    fn update_ticket_complete(&mut self, reservation: &ReservationRecord);

    fn update_lease_complete(&mut self, reservation: &ReservationRecord);
}

pub trait BrokerPolicy: Policy {
    /// Decides a new ticket request.
    fn bind(&mut self, reservation: &mut ReservationCore, cycle: u64) -> Result<bool, PolicyError>;

    /// Decides a ticket extension.
    fn extend_broker(
        &mut self,
        reservation: &mut ReservationCore,
        cycle: u64,
    ) -> Result<bool, PolicyError>;

    /// Resolves deferred requests.
    fn allocate(&mut self, cycle: u64) -> Vec<AllocationDecision>;

    /// Handle for operators when manual approval is enabled.
    fn approvals(&self) -> Option<ApprovalQueue> {
        None
    }
}

pub trait AuthorityPolicy: Policy {
    /// Decides a redeem: turns a ticket into concrete units.
    fn bind(&mut self, reservation: &mut ReservationCore, cycle: u64) -> Result<bool, PolicyError>;

    fn extend_authority(
        &mut self,
        reservation: &mut ReservationCore,
        cycle: u64,
    ) -> Result<bool, PolicyError>;

    /// Decides whether an advertised delegation may be handed out.
    fn bind_delegation(&mut self, delegation: &DelegationRecord) -> Result<bool, PolicyError>;

    fn allocate(&mut self, _cycle: u64) -> Vec<AllocationDecision> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllocationOutcome {
    Grant { term: Term, resources: ResourceSet },
    Deny(String),
}

/// Late answer to a request a policy deferred.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationDecision {
    pub reservation_id: ReservationId,
    pub outcome: AllocationOutcome,
}

impl AllocationDecision {
    #[must_use]
    pub fn grant(reservation_id: ReservationId, term: Term, resources: ResourceSet) -> Self {
        Self {
            reservation_id,
            outcome: AllocationOutcome::Grant { term, resources },
        }
    }

    #[must_use]
    pub fn deny(reservation_id: ReservationId, reason: impl Into<String>) -> Self {
        Self {
            reservation_id,
            outcome: AllocationOutcome::Deny(reason.into()),
        }
    }
}

/// Parses a delegation graph of the form `{"vm": 10, "vlan": 2}`.
///
/// Graphs are opaque to the kernel; the reference policies agree on this
/// JSON shape.
pub fn parse_unit_graph(graph: &str) -> Result<BTreeMap<ResourceType, u32>, PolicyError> {
    let raw: BTreeMap<String, u32> =
        serde_json::from_str(graph).map_err(|e| PolicyError::InvalidGraph(e.to_string()))?;
    Ok(raw.into_iter().map(|(k, v)| (ResourceType::from(k), v)).collect())
}

/// Inverse of [`parse_unit_graph`].
#[must_use]
pub fn unit_graph(units: &BTreeMap<String, u32>) -> String {
    serde_json::to_string(units).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_graph_roundtrip() {
        let mut units = BTreeMap::new();
        units.insert("vm".to_string(), 10);
        let parsed = parse_unit_graph(&unit_graph(&units)).unwrap();
        assert_eq!(parsed.get(&ResourceType::from("vm")), Some(&10));
    }

    #[test]
    fn malformed_graph_is_rejected() {
        assert!(matches!(
            parse_unit_graph("vm=10"),
            Err(PolicyError::InvalidGraph(_))
        ));
    }

    #[test]
    fn empty_bids() {
        assert!(Bids::default().is_empty());
    }
}

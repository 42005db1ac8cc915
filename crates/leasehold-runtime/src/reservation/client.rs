//! Controller-side reservation.
//!
//! Talks to two peers on two independent sequence channels: the broker
//! (`sequence_*`) for tickets and the authority (`lease_sequence_*`) for
//! leases.
//!
//! | From | Operation | To |
//! |------|-----------|----|
//! | `[Nascent, None]` | reserve / claim | `[Nascent, Ticketing]` |
//! | `[Ticketed\|Active, None]` | extend_ticket | `[_, ExtendingTicket]` |
//! | `[Ticketed, None]` | redeem | `[Ticketed, Redeeming]` |
//! | `[ActiveTicketed, None]` | extend_lease | `[ActiveTicketed, ExtendingLease]` |
//! | `[Active, None]` | modify_lease | `[Active, ModifyingLease]` |
//! | `Active*` | close | `[CloseWait, Closing]` |

use super::core::ReservationCore;
use crate::context::{OpContext, Outbound};
use crate::error::KernelError;
use leasehold_event::{ReservationWire, RpcFailure, RpcPayload, RpcRequestType};
use leasehold_types::{ActorId, ReservationPendingState, ReservationState, Term};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use ReservationPendingState as Pending;
use ReservationState as State;

/// Key in `ResourceData::resource` naming the authority that redeems a ticket.
pub const AUTHORITY_KEY: &str = "authority";

#[derive(Debug)]
pub struct ClientReservation {
    core: ReservationCore,
}

impl ClientReservation {
    #[must_use]
    pub fn new(core: ReservationCore) -> Self {
        Self { core }
    }

    #[must_use]
    pub fn core(&self) -> &ReservationCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ReservationCore {
        &mut self.core
    }

    fn require(&self, operation: &str, allowed: &[(State, Pending)]) -> Result<(), KernelError> {
        let current = (self.core.state(), self.core.pending());
        if allowed.contains(&current) {
            Ok(())
        } else {
            Err(KernelError::invalid_state(format!(
                "{operation} not allowed in [{}, {}] for {}",
                current.0,
                current.1,
                self.core.reservation_id()
            )))
        }
    }

    fn broker(&self) -> Result<ActorId, KernelError> {
        self.core.record().broker.ok_or_else(|| {
            KernelError::invalid_state(format!("{} has no broker", self.core.reservation_id()))
        })
    }

    /// The authority recorded on the reservation, or the one named by the
    /// ticket.
    fn authority(&self) -> Result<ActorId, KernelError> {
        let record = self.core.record();
        if let Some(authority) = record.authority {
            return Ok(authority);
        }
        [record.resources.as_ref(), record.approved_resources.as_ref()]
            .into_iter()
            .flatten()
            .find_map(|r| r.data.resource.get(AUTHORITY_KEY))
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| {
                KernelError::invalid_state(format!(
                    "{} has no authority",
                    self.core.reservation_id()
                ))
            })
    }

    fn send_to_broker(&mut self, kind: RpcRequestType, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let broker = self.broker()?;
        let record = self.core.record_mut();
        record.sequence_out += 1;
        let sequence = record.sequence_out;
        let wire = match kind {
            RpcRequestType::Relinquish => self.core.update_wire(),
            _ => self.core.request_wire(),
        };
        ctx.send(Outbound::new(kind, broker, sequence, RpcPayload::Reservation(wire)));
        Ok(())
    }

    fn send_to_authority(
        &mut self,
        kind: RpcRequestType,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        let authority = self.authority()?;
        let record = self.core.record_mut();
        record.authority = Some(authority);
        record.lease_sequence_out += 1;
        let sequence = record.lease_sequence_out;
        ctx.send(Outbound::new(
            kind,
            authority,
            sequence,
            RpcPayload::Reservation(self.lease_wire(kind)),
        ));
        Ok(())
    }

    /// Redeem and lease extension present the latest ticket; other lease
    /// requests present the lease.
    fn lease_wire(&self, kind: RpcRequestType) -> ReservationWire {
        let mut wire = self.core.holding_wire();
        if matches!(kind, RpcRequestType::Redeem | RpcRequestType::ExtendLease) {
            let record = self.core.record();
            if let Some(term) = record.approved_term {
                wire.term = Some(term);
            }
            if let Some(ticket) = &record.approved_resources {
                wire.resources = ticket.clone();
            }
        }
        wire
    }

    /// Asks the broker for a new ticket.
    pub fn reserve(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        self.require("ticket", &[(State::Nascent, Pending::None)])?;
        self.send_to_broker(RpcRequestType::Ticket, ctx)?;
        self.core.transition("ticket", State::Nascent, Pending::Ticketing);
        Ok(())
    }

    /// Claims a ticket the broker exported for this controller.
    pub fn claim(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        self.require("claim", &[(State::Nascent, Pending::None)])?;
        self.core.record_mut().exported = true;
        self.send_to_broker(RpcRequestType::ClaimTicket, ctx)?;
        self.core.transition("claim", State::Nascent, Pending::Ticketing);
        Ok(())
    }

    pub fn extend_ticket(
        &mut self,
        new_term: Term,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        let state = self.core.state();
        self.require(
            "extend ticket",
            &[
                (State::Ticketed, Pending::None),
                (State::Active, Pending::None),
            ],
        )?;
        if let Some(current) = self.core.term() {
            new_term.ensure_extends(current)?;
        }
        self.core.record_mut().requested_term = Some(new_term);
        self.send_to_broker(RpcRequestType::ExtendTicket, ctx)?;
        self.core
            .transition("extend ticket", state, Pending::ExtendingTicket);
        Ok(())
    }

    /// Presents the ticket to the authority.
    pub fn redeem(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        self.require("redeem", &[(State::Ticketed, Pending::None)])?;
        self.send_to_authority(RpcRequestType::Redeem, ctx)?;
        self.core.transition("redeem", State::Ticketed, Pending::Redeeming);
        Ok(())
    }

    /// Presents an extended ticket to the authority.
    pub fn extend_lease(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        self.require("extend lease", &[(State::ActiveTicketed, Pending::None)])?;
        self.send_to_authority(RpcRequestType::ExtendLease, ctx)?;
        self.core.transition(
            "extend lease",
            State::ActiveTicketed,
            Pending::ExtendingLease,
        );
        Ok(())
    }

    pub fn modify_lease(
        &mut self,
        config: &BTreeMap<String, String>,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        self.require("modify lease", &[(State::Active, Pending::None)])?;
        if let Some(resources) = self.core.record_mut().resources.as_mut() {
            resources
                .data
                .config
                .extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.send_to_authority(RpcRequestType::ModifyLease, ctx)?;
        self.core
            .transition("modify lease", State::Active, Pending::ModifyingLease);
        Ok(())
    }

    /// Gives the reservation up. A ticket goes back to the broker, a lease
    /// is closed at the authority and completes when it confirms.
    pub fn close(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        match (self.core.state(), self.core.pending()) {
            (State::Closed | State::CloseWait, _) => {
                debug!(rid = %self.core.reservation_id(), "close: already closing");
            }
            (State::Nascent, Pending::None) | (State::Failed, _) => {
                ctx.policy.close(&self.core);
                self.core.transition("close", State::Closed, Pending::None);
            }
            (State::Nascent, Pending::Ticketing) | (State::Ticketed, _) => {
                self.send_to_broker(RpcRequestType::Relinquish, ctx)?;
                ctx.policy.close(&self.core);
                self.core.transition("relinquish", State::Closed, Pending::None);
            }
            (State::Active | State::ActiveTicketed, _) => {
                self.send_to_authority(RpcRequestType::Close, ctx)?;
                ctx.policy.close(&self.core);
                self.core.transition("close", State::CloseWait, Pending::Closing);
            }
            (state, pending) => {
                return Err(KernelError::invalid_state(format!(
                    "close not allowed in [{state}, {pending}]"
                )));
            }
        }
        Ok(())
    }

    /// Absorbs a ticket update from the broker.
    pub fn update_ticket(&mut self, wire: &ReservationWire, ctx: &mut OpContext<'_>) {
        let core = &mut self.core;
        let terminal = core.state().is_terminal();
        if !terminal {
            core.record_mut().update.absorb(&wire.update);
            core.mark_dirty();
        }

        if terminal {
            debug!(rid = %core.reservation_id(), "ticket update after {}; superseded", core.state());
        } else if wire.update.is_failed() {
            let reason = wire.update.message().unwrap_or("no reason given");
            core.fail(format!("broker failed the ticket: {reason}"));
        } else if wire.closed {
            if core.state().is_active() {
                debug!(rid = %core.reservation_id(), "ticket closed by broker; lease continues");
            } else {
                ctx.policy.close(core);
                core.transition("ticket closed", State::Closed, Pending::None);
            }
        } else {
            let accepted = matches!(core.pending(), Pending::Ticketing | Pending::ExtendingTicket)
                || (core.pending().is_none() && core.state() == State::Ticketed);
            if accepted {
                // A lease keeps its units; the extended ticket waits in
                // the approved fields for extend_lease.
                let active = self.core.state().is_active();
                let absorbed = if active { Ok(()) } else { self.absorb_grant(wire) };
                if let Err(message) = absorbed {
                    self.core.fail(message);
                } else {
                    let record = self.core.record_mut();
                    record.approved_term = wire.term.or(record.approved_term);
                    record.approved_resources = Some(wire.resources.clone());
                    record.pending_recover = false;
                    let next = if active {
                        State::ActiveTicketed
                    } else {
                        State::Ticketed
                    };
                    self.core.transition("update ticket", next, Pending::None);
                }
            } else {
                warn!(
                    rid = %self.core.reservation_id(),
                    "ticket update in [{}, {}]; ignored",
                    self.core.state(),
                    self.core.pending()
                );
            }
        }

        if let Some(client) = ctx.policy.as_client_mut() {
            client.update_ticket_complete(self.core.record());
        }
    }

    /// Absorbs a lease update from the authority.
    pub fn update_lease(&mut self, wire: &ReservationWire, ctx: &mut OpContext<'_>) {
        let core = &mut self.core;
        let terminal = core.state().is_terminal();
        if !terminal {
            core.record_mut().update.absorb(&wire.update);
            core.mark_dirty();
        }

        if terminal {
            debug!(rid = %core.reservation_id(), "lease update after {}; superseded", core.state());
        } else if wire.update.is_failed() {
            let reason = wire.update.message().unwrap_or("no reason given");
            core.fail(format!("authority failed the lease: {reason}"));
        } else if wire.closed || core.pending() == Pending::Closing {
            core.transition("lease closed", State::Closed, Pending::None);
        } else if matches!(
            core.pending(),
            Pending::Redeeming | Pending::ExtendingLease | Pending::ModifyingLease
        ) {
            if let Err(message) = self.absorb_grant(wire) {
                self.core.fail(message);
            } else {
                self.core.record_mut().pending_recover = false;
                self.core.transition("update lease", State::Active, Pending::None);
            }
        } else {
            warn!(
                rid = %core.reservation_id(),
                "lease update in [{}, {}]; ignored",
                core.state(),
                core.pending()
            );
        }

        if let Some(client) = ctx.policy.as_client_mut() {
            client.update_lease_complete(self.core.record());
        }
    }

    fn absorb_grant(&mut self, wire: &ReservationWire) -> Result<(), String> {
        let record = self.core.record_mut();
        match record.resources.as_mut() {
            Some(current) => {
                if !current.absorb(&wire.resources) {
                    return Err(format!(
                        "resource type mismatch: held {}, granted {}",
                        current.rtype, wire.resources.rtype
                    ));
                }
            }
            None => record.resources = Some(wire.resources.clone()),
        }
        if wire.term.is_some() {
            record.term = wire.term;
        }
        Ok(())
    }

    /// A request to a peer could not be delivered or timed out. Only fails
    /// the reservation if that request is still the one outstanding.
    pub fn handle_failed_rpc(&mut self, failure: &RpcFailure) {
        let expected = match failure.request_type {
            RpcRequestType::Ticket | RpcRequestType::ClaimTicket => Pending::Ticketing,
            RpcRequestType::ExtendTicket => Pending::ExtendingTicket,
            RpcRequestType::Redeem => Pending::Redeeming,
            RpcRequestType::ExtendLease => Pending::ExtendingLease,
            RpcRequestType::ModifyLease => Pending::ModifyingLease,
            RpcRequestType::Close => Pending::Closing,
            other => {
                debug!(rid = %self.core.reservation_id(), "failed {}; nothing to do", other);
                return;
            }
        };
        if self.core.pending() == expected {
            self.core.fail(format!(
                "{} failed ({}): {}",
                failure.request_type, failure.kind, failure.message
            ));
        } else {
            debug!(
                rid = %self.core.reservation_id(),
                "stale failure for {} in [{}, {}]",
                failure.request_type,
                self.core.state(),
                self.core.pending()
            );
        }
    }

    /// Re-issues the request that was in flight when the actor stopped,
    /// with its original sequence number. Runs at most once per restart.
    pub fn recover(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, KernelError> {
        let record = self.core.record();
        if record.pending_recover {
            return Ok(false);
        }
        let (kind, to_broker) = match record.pending {
            Pending::Ticketing if record.exported => (RpcRequestType::ClaimTicket, true),
            Pending::Ticketing => (RpcRequestType::Ticket, true),
            Pending::ExtendingTicket => (RpcRequestType::ExtendTicket, true),
            Pending::Redeeming => (RpcRequestType::Redeem, false),
            Pending::ExtendingLease => (RpcRequestType::ExtendLease, false),
            Pending::ModifyingLease => (RpcRequestType::ModifyLease, false),
            Pending::Closing => (RpcRequestType::Close, false),
            _ => return Ok(false),
        };

        let outbound = if to_broker {
            Outbound::new(
                kind,
                self.broker()?,
                record.sequence_out,
                RpcPayload::Reservation(self.core.request_wire()),
            )
        } else {
            Outbound::new(
                kind,
                self.authority()?,
                record.lease_sequence_out,
                RpcPayload::Reservation(self.lease_wire(kind)),
            )
        };
        debug!(rid = %self.core.reservation_id(), "recover: reissuing {}", kind);
        ctx.send(outbound);
        self.core.record_mut().pending_recover = true;
        self.core.mark_dirty();
        Ok(true)
    }
}

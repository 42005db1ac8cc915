//! Reservation operations.
//!
//! Local operations drive the client half of a reservation. Inbound
//! operations are requests from peers; each one passes the sequence
//! arbiter before it reaches a state machine:
//!
//! | Verdict | Action |
//! |---------|--------|
//! | `Greater` | record the number, run the operation |
//! | `Equal` | duplicate, answer from the current state |
//! | `Smaller` | stale, drop |
//! | `InProgress` | newer request while one is pending, drop |

use super::Kernel;
use crate::context::OpContext;
use crate::error::{KernelError, ObjectKind};
use crate::reservation::{ClientReservation, Reservation, ReservationRecord, ReservationRole};
use leasehold_auth::Permission;
use leasehold_event::{ReservationWire, RpcMessage, RpcRequestType};
use leasehold_types::{
    compare_sequence, ActorId, ActorRole, ReservationId, ResourceSet, SequenceComparison, SliceId,
    Term,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

impl Kernel {
    fn with_client<T>(
        &mut self,
        rid: &ReservationId,
        f: impl FnOnce(&mut ClientReservation, &mut OpContext<'_>) -> Result<T, KernelError>,
    ) -> Result<T, KernelError> {
        let result = self.with_reservation(rid, |r, ctx| match r.as_client_mut() {
            Some(client) => f(client, ctx),
            None => Err(KernelError::invalid_argument(format!(
                "{rid} is not held by this actor"
            ))),
        })?;
        if result.is_ok() {
            self.grant_peers(rid)?;
        }
        result
    }

    /// Lets the broker and authority of a client reservation push updates
    /// into its slice.
    fn grant_peers(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        let Some(reservation) = self.reservations.get(rid) else {
            return Ok(());
        };
        let record = reservation.record();
        let peers: Vec<ActorId> = [record.broker, record.authority]
            .into_iter()
            .flatten()
            .collect();
        let slice_id = record.slice_id;
        self.grant(&slice_id, &peers, Permission::UPDATE)
    }

    pub(crate) fn grant(
        &mut self,
        slice_id: &SliceId,
        peers: &[ActorId],
        permission: Permission,
    ) -> Result<(), KernelError> {
        let slice = self.slice_mut(slice_id)?;
        let mut changed = false;
        for peer in peers {
            if !slice.guard().permissions_of(peer).contains(permission) {
                slice.grant(*peer, permission);
                changed = true;
            }
        }
        if changed {
            let snapshot = slice.clone();
            self.store.update_slice(&snapshot)?;
        }
        Ok(())
    }

    // === Local (client) ===

    /// Hands a registered reservation to the client policy, which bids for
    /// it on a later tick.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], [`KernelError::InvalidArgument`] without
    /// a client policy, or the policy's refusal.
    pub fn demand(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        let reservation = self
            .reservations
            .get(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?;
        let client = self
            .policy
            .as_client_mut()
            .ok_or_else(|| KernelError::invalid_argument("policy cannot demand reservations"))?;
        client.demand(reservation.record())?;
        Ok(())
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidState`] outside `[Nascent, None]`.
    pub fn ticket(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.reserve(ctx))
    }

    /// Claims a ticket the broker exported for this actor.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidState`] outside `[Nascent, None]`.
    pub fn claim(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.claim(ctx))
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidState`] unless ticketed or active with nothing
    /// pending, [`KernelError::InvalidArgument`] for a term that does not
    /// extend the current one.
    pub fn extend_ticket(&mut self, rid: &ReservationId, term: Term) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.extend_ticket(term, ctx))
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidState`] outside `[Ticketed, None]`.
    pub fn redeem(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.redeem(ctx))
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidState`] outside `[ActiveTicketed, None]`.
    pub fn extend_lease(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.extend_lease(ctx))
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidState`] unless active with nothing pending.
    pub fn modify_lease(
        &mut self,
        rid: &ReservationId,
        config: &BTreeMap<String, String>,
    ) -> Result<(), KernelError> {
        self.with_client(rid, |c, ctx| c.modify_lease(config, ctx))
    }

    /// Closes a held reservation, or, on an issuer, closes it and tells
    /// the holder.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] or the client state machine's refusal.
    pub fn close(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        let held = self
            .reservations
            .get(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?
            .core()
            .role()
            == ReservationRole::Client;
        if held {
            self.with_client(rid, |c, ctx| c.close(ctx))
        } else {
            self.with_reservation(rid, |r, ctx| r.close_issued(ctx))
        }
    }

    // === Local (broker) ===

    /// Issues a ticket nobody asked for yet. The claimant picks it up with
    /// a `ClaimTicket` naming the returned id.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a non-broker,
    /// [`KernelError::NotFound`] for an unknown slice, or a store error.
    pub fn export(
        &mut self,
        slice_id: SliceId,
        resources: ResourceSet,
        term: Term,
        claimant: ActorId,
    ) -> Result<ReservationId, KernelError> {
        if self.role != ActorRole::Broker {
            return Err(KernelError::invalid_argument(format!(
                "a {} cannot export tickets",
                self.role
            )));
        }
        let slice_name = self
            .slices
            .get(&slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))?
            .name()
            .to_string();
        let mut record = ReservationRecord::new(
            ReservationRole::Broker,
            slice_id,
            slice_name,
            resources,
            Some(term),
        );
        record.exported = true;
        let rid = self.register_reservation(record)?;
        self.grant(&slice_id, &[claimant], Permission::RESERVE | Permission::UPDATE)?;
        self.with_reservation(&rid, |r, ctx| {
            let wire = r.core().request_wire();
            r.issue(&wire, false, ctx)
        })??;
        Ok(rid)
    }

    // === Inbound (issuer) ===

    fn expect_role(&self, kind: RpcRequestType, role: ActorRole) -> Result<(), KernelError> {
        if self.role == role {
            Ok(())
        } else {
            Err(KernelError::invalid_argument(format!(
                "{kind} is not served by a {}",
                self.role
            )))
        }
    }

    /// Records the sequence number of an accepted request.
    fn arbitrate(
        &mut self,
        rid: &ReservationId,
        message: &RpcMessage,
    ) -> Result<SequenceComparison, KernelError> {
        let reservation = self
            .reservations
            .get_mut(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?;
        let record = reservation.record();
        let (last, pending) = (record.sequence_in, record.pending);
        let verdict = compare_sequence(message.sequence, last, !pending.is_none());
        match verdict {
            SequenceComparison::Greater => {
                let core = reservation.core_mut();
                core.record_mut().sequence_in = message.sequence;
                core.mark_dirty();
            }
            SequenceComparison::Equal => {
                debug!(rid = %rid, "duplicate {} seq={}", message.kind, message.sequence);
            }
            SequenceComparison::Smaller => {
                warn!(
                    rid = %rid,
                    "stale {} seq={} (last {}); dropped", message.kind, message.sequence, last
                );
            }
            SequenceComparison::InProgress => {
                warn!(
                    rid = %rid,
                    "{} seq={} while {} pending; dropped", message.kind, message.sequence, pending
                );
            }
        }
        Ok(verdict)
    }

    /// `Ticket` on a broker, `Redeem` on an authority. The first request
    /// for an id creates the reservation in a slice owned by the caller.
    ///
    /// # Errors
    ///
    /// Validation errors for the wrong role or a missing callback, or a
    /// store error.
    pub fn issue_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        let role = match message.kind {
            RpcRequestType::Ticket => ActorRole::Broker,
            _ => ActorRole::Authority,
        };
        self.expect_role(message.kind, role)?;
        let callback = message.require_callback()?;
        let rid = wire.reservation_id;

        let created = !self.reservations.contains_key(&rid);
        if created {
            let (record_role, kind) = self.issuer_role()?;
            self.get_or_create_local_slice(wire.slice_id, &wire.slice_name, &message.caller, kind)?;
            let mut record = ReservationRecord::from_wire(record_role, wire);
            record.callback = Some(callback);
            self.register_reservation(record)?;
        }

        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater if created => {
                self.with_reservation(&rid, |r, ctx| r.issue(wire, false, ctx))??;
            }
            SequenceComparison::Greater => {
                self.with_reservation(&rid, |r, _| {
                    r.core_mut()
                        .fail_notify(format!("{} for an existing reservation", message.kind));
                })?;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// `ExtendTicket` on a broker, `ExtendLease` on an authority.
    ///
    /// # Errors
    ///
    /// Validation errors for the wrong role or an unknown reservation.
    pub fn extend_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        let role = match message.kind {
            RpcRequestType::ExtendTicket => ActorRole::Broker,
            _ => ActorRole::Authority,
        };
        self.expect_role(message.kind, role)?;
        let rid = wire.reservation_id;
        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater => {
                self.with_reservation(&rid, |r, ctx| r.issue(wire, true, ctx))??;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// A client claims a ticket exported to it.
    ///
    /// # Errors
    ///
    /// Validation errors for the wrong role, an unknown or unexported
    /// reservation, or a missing callback.
    pub fn claim_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        self.expect_role(message.kind, ActorRole::Broker)?;
        let callback = message.require_callback()?;
        let rid = wire.reservation_id;
        let exported = self
            .reservations
            .get(&rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?
            .record()
            .exported;
        if !exported {
            return Err(KernelError::invalid_argument(format!("{rid} is not exported")));
        }
        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater => {
                self.with_reservation(&rid, |r, _| r.claim(callback, message.message_id))??;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// The holder hands a ticket back. No update is sent.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], or [`KernelError::InvalidArgument`] for
    /// a reservation this actor holds rather than issued.
    pub fn relinquish_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        let rid = wire.reservation_id;
        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater => {
                self.with_reservation(&rid, |r, ctx| r.relinquish(ctx))??;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Validation errors for the wrong role or an unknown reservation.
    pub fn modify_lease_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        self.expect_role(message.kind, ActorRole::Authority)?;
        let rid = wire.reservation_id;
        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater => {
                let config = &wire.resources.data.config;
                self.with_reservation(&rid, |r, _| match r.as_authority_mut() {
                    Some(lease) => {
                        lease.modify_lease(config);
                        Ok(())
                    }
                    None => Err(KernelError::invalid_argument(format!(
                        "{rid} is not a lease issued here"
                    ))),
                })??;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// The holder closes a lease.
    ///
    /// # Errors
    ///
    /// Validation errors for the wrong role or an unknown reservation.
    pub fn close_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        self.expect_role(message.kind, ActorRole::Authority)?;
        let rid = wire.reservation_id;
        match self.arbitrate(&rid, message)? {
            SequenceComparison::Greater => {
                self.with_reservation(&rid, |r, ctx| r.close_issued(ctx))?;
            }
            SequenceComparison::Equal => {
                self.with_reservation(&rid, |r, ctx| r.handle_duplicate_request(message.kind, ctx))??;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    // === Inbound (holder) ===

    /// `UpdateTicket` from the broker or `UpdateLease` from the authority.
    /// Only numbers above the last one seen on that channel are applied.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], or [`KernelError::InvalidArgument`] when
    /// the reservation is not held here.
    pub fn update_request(
        &mut self,
        message: &RpcMessage,
        wire: &ReservationWire,
    ) -> Result<(), KernelError> {
        let rid = wire.reservation_id;
        let lease = message.kind == RpcRequestType::UpdateLease;
        let reservation = self
            .reservations
            .get_mut(&rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?;
        let Reservation::Client(client) = reservation else {
            return Err(KernelError::invalid_argument(format!(
                "{} for {rid}, which is not held here",
                message.kind
            )));
        };
        let record = client.core().record();
        let last = if lease {
            record.lease_sequence_in
        } else {
            record.sequence_in
        };
        if compare_sequence(message.sequence, last, false) != SequenceComparison::Greater {
            debug!(
                rid = %rid,
                "{} seq={} not newer than {}; ignored", message.kind, message.sequence, last
            );
            return Ok(());
        }
        {
            let core = client.core_mut();
            let record = core.record_mut();
            if lease {
                record.lease_sequence_in = message.sequence;
            } else {
                record.sequence_in = message.sequence;
            }
            core.mark_dirty();
        }
        self.with_client(&rid, |c, ctx| {
            if lease {
                c.update_lease(wire, ctx);
            } else {
                c.update_ticket(wire, ctx);
            }
            Ok(())
        })
    }
}

//! Issuer-side reservation behaviour.
//!
//! Brokers issue tickets and authorities issue leases, but both follow the
//! same request → policy → priming → update pipeline:
//!
//! ```text
//!  request (bid_pending = true)
//!     │
//!     ▼
//!  map_and_update ──policy defers──► [_, CREATING/EXTENDING]  (probe retries
//!     │                                                       once the policy
//!     │ policy grants                                         decided)
//!     ▼
//!  [ISSUED, Priming] ──probe──► AbsorbUpdate ──► [ISSUED, None] + update
//! ```
//!
//! [`ServerReservation`] captures that pipeline once; the two roles only
//! name their states and reach their policy capability.

use super::core::ReservationCore;
use crate::context::{OpContext, Outbound};
use crate::error::KernelError;
use crate::policy::{AllocationOutcome, PolicyError};
use leasehold_event::{ReservationWire, RpcFailure, RpcPayload, RpcRequestType};
use leasehold_types::{ActorId, MessageId, ReservationPendingState, ReservationState};
use tracing::{debug, warn};

use ReservationPendingState as Pending;

pub trait ServerReservation {
    /// State after a successful request (`Ticketed` or `Active`).
    const ISSUED: ReservationState;
    /// Pending marker while a new request is decided.
    const CREATING: ReservationPendingState;
    /// Pending marker while an extension is decided.
    const EXTENDING: ReservationPendingState;
    /// Message kind for updates to the holder.
    const UPDATE_KIND: RpcRequestType;

    fn core(&self) -> &ReservationCore;
    fn core_mut(&mut self) -> &mut ReservationCore;

    fn policy_bind(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError>;
    fn policy_extend(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError>;

    /// Copies what the holder asked for from an inbound request.
    fn absorb_request(&mut self, wire: &ReservationWire) {
        let core = self.core_mut();
        let record = core.record_mut();
        record.requested_resources = wire.resources.clone();
        if wire.term.is_some() {
            record.requested_term = wire.term;
        }
        record.renewable = wire.renewable;
        core.mark_dirty();
    }

    /// Handles a fresh request for a new reservation.
    fn reserve(&mut self, ctx: &mut OpContext<'_>) {
        let core = self.core_mut();
        core.record_mut().bid_pending = true;
        core.mark_dirty();
        self.map_and_update(false, ctx);
    }

    /// Handles a fresh extension request.
    fn extend(&mut self, ctx: &mut OpContext<'_>) {
        let core = self.core_mut();
        if !core.state().is_terminal() {
            core.record_mut().bid_pending = true;
            core.mark_dirty();
        }
        self.map_and_update(true, ctx);
    }

    /// Runs the policy for a request and installs the result.
    ///
    /// `ticketed` is true for extensions of an issued reservation. The
    /// policy is only consulted while `bid_pending` is set; afterwards the
    /// recorded approval is used.
    fn map_and_update(&mut self, ticketed: bool, ctx: &mut OpContext<'_>) {
        let state = self.core().state();

        if matches!(state, ReservationState::Failed | ReservationState::Closed) {
            if let Err(e) = self.resend_update(ctx) {
                warn!(rid = %self.core().reservation_id(), "cannot resend {} update: {}", state, e);
            }
            return;
        }

        let creating = match (state, ticketed) {
            (ReservationState::Nascent, false) => true,
            (s, true) if s == Self::ISSUED => false,
            (s, t) => {
                self.core_mut().fail_notify(format!(
                    "map_and_update: unexpected state {s} (ticketed={t})"
                ));
                return;
            }
        };
        let (prefix, marker) = if creating {
            ("bind", Self::CREATING)
        } else {
            ("extend", Self::EXTENDING)
        };

        let granted = if self.core().record().bid_pending {
            let decision = if creating {
                self.policy_bind(ctx)
            } else {
                self.policy_extend(ctx)
            };
            match decision {
                Ok(granted) => granted,
                Err(e) => {
                    self.core_mut()
                        .fail_notify(format!("policy {prefix} failed: {e}"));
                    return;
                }
            }
        } else if self.core().has_approval() {
            true
        } else {
            self.core_mut()
                .fail_notify(format!("{prefix}: no approval recorded"));
            return;
        };

        self.core_mut().transition(prefix, state, marker);
        if !granted {
            debug!(rid = %self.core().reservation_id(), "{}: decision deferred", prefix);
            return;
        }

        let core = self.core_mut();
        core.record_mut().bid_pending = false;
        if let Err(message) = core.install_approval(!creating) {
            core.fail_notify(format!("{prefix}: {message}"));
            return;
        }
        core.transition(prefix, Self::ISSUED, Pending::Priming);
    }

    /// Applies a decision the policy produced after deferring.
    fn apply_decision(&mut self, outcome: AllocationOutcome) {
        let core = self.core_mut();
        if !core.record().bid_pending {
            warn!(rid = %core.reservation_id(), "allocation decision without a pending bid");
            return;
        }
        core.record_mut().bid_pending = false;
        match outcome {
            AllocationOutcome::Grant { term, resources } => core.approve(term, resources),
            AllocationOutcome::Deny(reason) => core.fail_notify(reason),
        }
        core.mark_dirty();
    }

    /// Picks the action the next [`service_probe`](Self::service_probe) runs.
    fn probe_pending(&mut self, ctx: &mut OpContext<'_>) {
        self.core_mut().set_service_pending(Pending::None);

        let record = self.core().record();
        let (state, pending) = (record.state, record.pending);
        let (bid_pending, update_pending, notified) =
            (record.bid_pending, record.update_pending, record.notified_failed);

        if state == ReservationState::Failed {
            if !notified {
                self.core_mut().set_service_pending(Pending::SendUpdate);
            }
            return;
        }

        if (pending == Self::CREATING || pending == Self::EXTENDING) && !bid_pending {
            self.map_and_update(pending == Self::EXTENDING, ctx);
            if self.core().pending() == Pending::Priming {
                self.core_mut().set_service_pending(Pending::AbsorbUpdate);
            }
        } else if pending == Pending::Priming {
            self.core_mut().set_service_pending(Pending::AbsorbUpdate);
        } else if pending == Pending::None && update_pending {
            self.core_mut().set_service_pending(Pending::SendUpdate);
        }
    }

    /// Executes the action chosen by [`probe_pending`](Self::probe_pending).
    fn service_probe(&mut self, ctx: &mut OpContext<'_>) {
        match self.core_mut().take_service_pending() {
            Pending::AbsorbUpdate => {
                let core = self.core_mut();
                core.transition("absorb", Self::ISSUED, Pending::None);
                core.record_mut().update_pending = false;
                if let Err(e) = self.generate_update(ctx) {
                    self.core_mut().fail(format!("update failed: {e}"));
                }
            }
            Pending::SendUpdate => {
                let failed = self.core().is_failed();
                let result = self.generate_update(ctx);
                let core = self.core_mut();
                if failed {
                    core.record_mut().notified_failed = true;
                    core.mark_dirty();
                } else if let Err(e) = result {
                    core.fail(format!("update failed: {e}"));
                }
            }
            _ => {}
        }
    }

    /// Sends a fresh update to the holder.
    ///
    /// An exported reservation nobody has claimed yet has no callback; the
    /// update is skipped and the claim will ask for one.
    fn generate_update(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let core = self.core_mut();
        let Some(to) = core.record().callback else {
            if core.record().exported {
                debug!(rid = %core.reservation_id(), "unclaimed export; update deferred");
                return Ok(());
            }
            return Err(KernelError::invalid_state(format!(
                "{} has no callback",
                core.reservation_id()
            )));
        };

        let record = core.record_mut();
        record.sequence_out += 1;
        record.update_pending = false;
        record.pending_recover = false;
        let sequence = record.sequence_out;
        let reply_to = record.reply_to.take();
        core.mark_dirty();

        ctx.send(
            Outbound::new(
                Self::UPDATE_KIND,
                to,
                sequence,
                RpcPayload::Reservation(core.update_wire()),
            )
            .in_reply_to(reply_to),
        );
        Ok(())
    }

    /// Sends the last update again with its original sequence number.
    fn resend_update(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let core = self.core();
        let sequence = core.record().sequence_out;
        if sequence == 0 {
            return self.generate_update(ctx);
        }
        let Some(to) = core.record().callback else {
            if core.record().exported {
                return Ok(());
            }
            return Err(KernelError::invalid_state(format!(
                "{} has no callback",
                core.reservation_id()
            )));
        };
        ctx.send(Outbound::new(
            Self::UPDATE_KIND,
            to,
            sequence,
            RpcPayload::Reservation(core.update_wire()),
        ));
        Ok(())
    }

    /// Answers a request whose sequence number was already processed.
    fn handle_duplicate_request(
        &mut self,
        operation: RpcRequestType,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        match operation {
            RpcRequestType::Ticket
            | RpcRequestType::ExtendTicket
            | RpcRequestType::ClaimTicket
            | RpcRequestType::Redeem
            | RpcRequestType::ExtendLease
            | RpcRequestType::ModifyLease
            | RpcRequestType::Close => {
                let record = self.core().record();
                if record.pending.is_none() && !record.pending_recover {
                    self.resend_update(ctx)
                } else {
                    debug!(
                        rid = %record.reservation_id,
                        "duplicate {} while {}; ignored", operation, record.pending
                    );
                    Ok(())
                }
            }
            RpcRequestType::Relinquish => {
                debug!(rid = %self.core().reservation_id(), "duplicate relinquish; ignored");
                Ok(())
            }
            other => Err(KernelError::invalid_state(format!(
                "no duplicate handling for {other}"
            ))),
        }
    }

    /// Closes the reservation and tells the holder.
    fn close(&mut self, ctx: &mut OpContext<'_>) {
        let core = self.core_mut();
        if core.is_closed() {
            debug!(rid = %core.reservation_id(), "already closed");
            return;
        }

        let record = core.record();
        let deciding = record.pending == Self::CREATING || record.pending == Self::EXTENDING;
        if record.pending == Pending::Priming || (deciding && !record.bid_pending) {
            core.record_mut().closed_in_priming = true;
        }

        ctx.policy.close(core);
        core.transition("close", ReservationState::Closed, Pending::None);

        if core.record().callback.is_some() {
            if let Err(e) = self.generate_update(ctx) {
                warn!(rid = %self.core().reservation_id(), "close update not sent: {}", e);
            }
        }
    }

    /// The holder gave the reservation back; no update is owed.
    fn relinquish(&mut self, ctx: &mut OpContext<'_>) {
        let core = self.core_mut();
        if core.is_closed() {
            debug!(rid = %core.reservation_id(), "relinquish of closed reservation; ignored");
            return;
        }
        ctx.policy.release(core);
        core.transition("relinquish", ReservationState::Closed, Pending::None);
    }

    /// Binds an exported reservation to the peer claiming it.
    fn claim(&mut self, callback: ActorId, request: MessageId) {
        let core = self.core_mut();
        let record = core.record_mut();
        record.callback = Some(callback);
        record.reply_to = Some(request);
        record.update_pending = true;
        core.mark_dirty();
    }

    /// An update to the holder could not be delivered.
    fn handle_failed_rpc(&mut self, failure: &RpcFailure) {
        let core = self.core_mut();
        warn!(
            rid = %core.reservation_id(),
            "{} to holder failed ({}): {}", failure.request_type, failure.kind, failure.message
        );
        core.record_mut()
            .update
            .post_event(format!("{} not delivered: {}", failure.request_type, failure.message));
        core.mark_dirty();
    }

    /// Resumes after a restart. A request still waiting on the policy is
    /// decided again since the policy lost its queue.
    fn recover(&mut self, ctx: &mut OpContext<'_>) {
        let record = self.core().record();
        let pending = record.pending;
        if pending.is_none() || record.pending_recover {
            return;
        }
        let bid_pending = record.bid_pending;

        let core = self.core_mut();
        core.record_mut().pending_recover = true;
        core.mark_dirty();

        if bid_pending && (pending == Self::CREATING || pending == Self::EXTENDING) {
            debug!(rid = %core.reservation_id(), "recover: deciding {} again", pending);
            self.map_and_update(pending == Self::EXTENDING, ctx);
        }
    }
}

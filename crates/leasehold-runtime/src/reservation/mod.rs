//! Reservation state machines.
//!
//! A reservation moves along two axes at once: a primary
//! [`ReservationState`] and a
//! [`ReservationPendingState`](leasehold_types::ReservationPendingState) naming the
//! operation in flight. The persistent half is a plain
//! [`ReservationRecord`]; the runtime half is a [`Reservation`] rebuilt
//! from it with [`Reservation::restore`].
//!
//! # Roles
//!
//! | Variant | Issues | Module |
//! |---------|--------|--------|
//! | [`Reservation::Client`] | ticket, redeem, extend, close requests | `client` |
//! | [`Reservation::Broker`] | tickets | `broker` |
//! | [`Reservation::Authority`] | leases | `authority` |
//!
//! Broker and authority share their behaviour through [`ServerReservation`].

mod authority;
mod broker;
mod client;
mod core;
mod record;
mod server;

pub use authority::AuthorityReservation;
pub use broker::BrokerReservation;
pub use client::{ClientReservation, AUTHORITY_KEY};
pub use core::ReservationCore;
pub use record::{ReservationRecord, ReservationRole};
pub use server::ServerReservation;

use crate::context::OpContext;
use crate::error::KernelError;
use crate::policy::AllocationOutcome;
use leasehold_event::{ReservationWire, RpcFailure, RpcRequestType};
use leasehold_types::{ActorId, MessageId, ReservationState, SliceId};

macro_rules! issued {
    ($self:expr, $r:ident => $body:expr) => {
        match $self {
            Reservation::Broker($r) => Ok($body),
            Reservation::Authority($r) => Ok($body),
            Reservation::Client(r) => Err(KernelError::invalid_argument(format!(
                "{} is held, not issued, by this actor",
                r.core().reservation_id()
            ))),
        }
    };
}

/// A reservation in one of its three roles.
#[derive(Debug)]
pub enum Reservation {
    Client(ClientReservation),
    Broker(BrokerReservation),
    Authority(AuthorityReservation),
}

impl Reservation {
    /// Builds the runtime object for a record, picking the role from it.
    #[must_use]
    pub fn restore(record: ReservationRecord) -> Self {
        let role = record.role;
        let core = ReservationCore::new(record);
        match role {
            ReservationRole::Client => Self::Client(ClientReservation::new(core)),
            ReservationRole::Broker => Self::Broker(BrokerReservation::new(core)),
            ReservationRole::Authority => Self::Authority(AuthorityReservation::new(core)),
        }
    }

    #[must_use]
    pub fn core(&self) -> &ReservationCore {
        match self {
            Self::Client(r) => r.core(),
            Self::Broker(r) => r.core(),
            Self::Authority(r) => r.core(),
        }
    }

    pub fn core_mut(&mut self) -> &mut ReservationCore {
        match self {
            Self::Client(r) => r.core_mut(),
            Self::Broker(r) => r.core_mut(),
            Self::Authority(r) => r.core_mut(),
        }
    }

    #[must_use]
    pub fn record(&self) -> &ReservationRecord {
        self.core().record()
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn to_record(&self) -> ReservationRecord {
        self.record().clone()
    }

    #[must_use]
    pub fn slice_id(&self) -> SliceId {
        self.core().slice_id()
    }

    #[must_use]
    pub fn state(&self) -> ReservationState {
        self.core().state()
    }

    pub fn as_client_mut(&mut self) -> Option<&mut ClientReservation> {
        match self {
            Self::Client(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_broker_mut(&mut self) -> Option<&mut BrokerReservation> {
        match self {
            Self::Broker(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_authority_mut(&mut self) -> Option<&mut AuthorityReservation> {
        match self {
            Self::Authority(r) => Some(r),
            _ => None,
        }
    }

    /// Whether the next tick should probe this reservation.
    #[must_use]
    pub fn needs_probe(&self) -> bool {
        let record = self.record();
        match self {
            Self::Client(_) => false,
            Self::Broker(_) | Self::Authority(_) => {
                !record.pending.is_none()
                    || record.update_pending
                    || (record.state == ReservationState::Failed && !record.notified_failed)
            }
        }
    }

    /// Runs one probe round (`probe_pending` then `service_probe`) on
    /// issuer roles.
    pub fn probe(&mut self, ctx: &mut OpContext<'_>) {
        match self {
            Self::Client(_) => {}
            Self::Broker(r) => {
                r.probe_pending(ctx);
                r.service_probe(ctx);
            }
            Self::Authority(r) => {
                r.probe_pending(ctx);
                r.service_probe(ctx);
            }
        }
    }

    /// Applies a late policy decision. Only issuer roles have bids.
    pub fn apply_decision(&mut self, outcome: AllocationOutcome) {
        match self {
            Self::Client(_) => {}
            Self::Broker(r) => r.apply_decision(outcome),
            Self::Authority(r) => r.apply_decision(outcome),
        }
    }

    pub fn handle_failed_rpc(&mut self, failure: &RpcFailure) {
        match self {
            Self::Client(r) => r.handle_failed_rpc(failure),
            Self::Broker(r) => r.handle_failed_rpc(failure),
            Self::Authority(r) => r.handle_failed_rpc(failure),
        }
    }

    /// Resumes whatever was pending when the record was written.
    pub fn recover(&mut self, ctx: &mut OpContext<'_>) {
        match self {
            Self::Client(r) => {
                if let Err(e) = r.recover(ctx) {
                    r.core_mut().fail(format!("recovery failed: {e}"));
                }
            }
            Self::Broker(r) => r.recover(ctx),
            Self::Authority(r) => r.recover(ctx),
        }
    }

    /// Starts a fresh or extending bid from an inbound request.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a client reservation.
    pub fn issue(
        &mut self,
        wire: &ReservationWire,
        extending: bool,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        issued!(self, r => {
            r.absorb_request(wire);
            if extending {
                r.extend(ctx);
            } else {
                r.reserve(ctx);
            }
        })
    }

    /// Answers a request carrying an already processed sequence number.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a client reservation, or
    /// whatever resending the last update failed with.
    pub fn handle_duplicate_request(
        &mut self,
        kind: RpcRequestType,
        ctx: &mut OpContext<'_>,
    ) -> Result<(), KernelError> {
        issued!(self, r => r.handle_duplicate_request(kind, ctx))?
    }

    /// Binds an exported reservation to its claimant.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a client reservation.
    pub fn claim(&mut self, callback: ActorId, request: MessageId) -> Result<(), KernelError> {
        issued!(self, r => r.claim(callback, request))
    }

    /// The holder gave the reservation back.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a client reservation.
    pub fn relinquish(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        issued!(self, r => r.relinquish(ctx))
    }

    /// Closes from the issuer side, e.g. when the term expired.
    pub fn close_issued(&mut self, ctx: &mut OpContext<'_>) {
        match self {
            Self::Client(_) => {}
            Self::Broker(r) => r.close(ctx),
            Self::Authority(r) => r.close(ctx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::{ReservationPendingState, ResourceSet};

    fn record(role: ReservationRole) -> ReservationRecord {
        ReservationRecord::new(role, SliceId::new(), "demo", ResourceSet::new(1, "vm"), None)
    }

    #[test]
    fn restore_picks_variant_from_role() {
        assert!(matches!(
            Reservation::restore(record(ReservationRole::Client)),
            Reservation::Client(_)
        ));
        assert!(matches!(
            Reservation::restore(record(ReservationRole::Broker)),
            Reservation::Broker(_)
        ));
        assert!(matches!(
            Reservation::restore(record(ReservationRole::Authority)),
            Reservation::Authority(_)
        ));
    }

    #[test]
    fn restored_record_is_clean_and_equal() {
        let mut rec = record(ReservationRole::Broker);
        rec.pending = ReservationPendingState::Priming;
        rec.sequence_in = 4;
        let r = Reservation::restore(rec.clone());
        assert_eq!(r.to_record(), rec);
        assert!(!r.core().is_dirty());
    }

    #[test]
    fn probe_selection() {
        let mut client = record(ReservationRole::Client);
        client.pending = ReservationPendingState::Ticketing;
        assert!(!Reservation::restore(client).needs_probe());

        let idle = record(ReservationRole::Broker);
        assert!(!Reservation::restore(idle).needs_probe());

        let mut priming = record(ReservationRole::Authority);
        priming.pending = ReservationPendingState::Priming;
        assert!(Reservation::restore(priming).needs_probe());

        let mut failed = record(ReservationRole::Broker);
        failed.state = ReservationState::Failed;
        assert!(Reservation::restore(failed.clone()).needs_probe());
        failed.notified_failed = true;
        assert!(!Reservation::restore(failed).needs_probe());
    }
}

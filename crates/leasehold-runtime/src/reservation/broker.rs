//! Broker-side reservation: issues tickets.

use super::core::ReservationCore;
use super::server::ServerReservation;
use crate::context::OpContext;
use crate::policy::PolicyError;
use leasehold_event::RpcRequestType;
use leasehold_types::{ReservationPendingState, ReservationState};

#[derive(Debug)]
pub struct BrokerReservation {
    core: ReservationCore,
}

impl BrokerReservation {
    #[must_use]
    pub fn new(core: ReservationCore) -> Self {
        Self { core }
    }
}

impl ServerReservation for BrokerReservation {
    const ISSUED: ReservationState = ReservationState::Ticketed;
    const CREATING: ReservationPendingState = ReservationPendingState::Ticketing;
    const EXTENDING: ReservationPendingState = ReservationPendingState::ExtendingTicket;
    const UPDATE_KIND: RpcRequestType = RpcRequestType::UpdateTicket;

    fn core(&self) -> &ReservationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReservationCore {
        &mut self.core
    }

    fn policy_bind(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError> {
        let cycle = ctx.cycle;
        ctx.policy
            .as_broker_mut()
            .ok_or(PolicyError::MissingCapability("broker"))?
            .bind(&mut self.core, cycle)
    }

    fn policy_extend(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError> {
        let cycle = ctx.cycle;
        ctx.policy
            .as_broker_mut()
            .ok_or(PolicyError::MissingCapability("broker"))?
            .extend_broker(&mut self.core, cycle)
    }
}

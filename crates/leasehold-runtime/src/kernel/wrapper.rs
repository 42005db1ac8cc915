//! Validated entry points into the [`Kernel`].
//!
//! Every public operation checks its arguments and the caller's access to
//! the slice involved, forwards to the kernel and commits. Inbound RPC
//! messages go through [`KernelWrapper::process`], which routes by request
//! type.
//!
//! # Access
//!
//! | Operation | Permission on the slice |
//! |-----------|-------------------------|
//! | requests (ticket, redeem, extend, close, claims, relinquish) | `RESERVE` |
//! | updates (`UpdateTicket`, `UpdateLease`, delegation updates) | `UPDATE` |
//!
//! A request naming a slice this actor has never seen passes; the slice is
//! created with the caller as its owner.

use super::Kernel;
use crate::delegation::{DelegationRecord, DelegationRole};
use crate::error::{KernelError, ObjectKind};
use crate::reservation::{ReservationRecord, ReservationRole};
use crate::slice::Slice;
use leasehold_event::{FailureKind, RpcFailure, RpcMessage, RpcPayload, RpcRequestType};
use leasehold_types::{
    ActorId, ActorRole, AuthToken, DelegationId, ErrorCode, ReservationId, ResourceSet, SliceId,
    Term,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
enum Access {
    Reserve,
    Update,
}

/// The kernel behind argument and access checks.
#[derive(Debug)]
pub struct KernelWrapper {
    kernel: Kernel,
}

impl KernelWrapper {
    #[must_use]
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    #[must_use]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    #[must_use]
    pub fn identity(&self) -> &AuthToken {
        self.kernel.identity()
    }

    fn authorize_slice(
        &self,
        slice_id: &SliceId,
        caller: &AuthToken,
        access: Access,
    ) -> Result<(), KernelError> {
        let slice = self
            .kernel
            .slice(slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))?;
        match access {
            Access::Reserve => slice.guard().check_reserve(caller)?,
            Access::Update => slice.guard().check_update(caller)?,
        }
        Ok(())
    }

    fn authorize_reservation(
        &self,
        rid: &ReservationId,
        caller: &AuthToken,
        access: Access,
    ) -> Result<(), KernelError> {
        let slice_id = self
            .kernel
            .reservation(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?
            .slice_id();
        self.authorize_slice(&slice_id, caller, access)
    }

    fn authorize_delegation(
        &self,
        did: &DelegationId,
        caller: &AuthToken,
        access: Access,
    ) -> Result<(), KernelError> {
        let slice_id = self
            .kernel
            .delegation(did)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Delegation, did))?
            .slice_id();
        self.authorize_slice(&slice_id, caller, access)
    }

    /// Commits whatever `result` left behind. The operation's own error
    /// wins over a commit error.
    fn commit<T>(&mut self, result: Result<T, KernelError>) -> Result<T, KernelError> {
        let committed = self.kernel.commit();
        let value = result?;
        committed?;
        Ok(value)
    }

    // === Slices ===

    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an empty name,
    /// [`KernelError::AlreadyRegistered`], or a store error.
    pub fn register_slice(&mut self, slice: Slice) -> Result<SliceId, KernelError> {
        if slice.name().trim().is_empty() {
            return Err(KernelError::invalid_argument("slice name is empty"));
        }
        let slice_id = slice.slice_id();
        self.kernel.register_slice(slice)?;
        Ok(slice_id)
    }

    /// # Errors
    ///
    /// Access, state or store errors.
    pub fn remove_slice(&mut self, slice_id: &SliceId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_slice(slice_id, caller, Access::Reserve)?;
        self.kernel.remove_slice(slice_id)
    }

    // === Reservations (local) ===

    /// Adds a client reservation. Issuer reservations come into being
    /// through inbound requests or [`KernelWrapper::export`].
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an issuer role, a missing
    /// broker or an empty request; access or store errors.
    pub fn register_reservation(
        &mut self,
        record: ReservationRecord,
        caller: &AuthToken,
    ) -> Result<ReservationId, KernelError> {
        if record.role != ReservationRole::Client {
            return Err(KernelError::invalid_argument(format!(
                "cannot register a {} reservation locally",
                record.role
            )));
        }
        if record.broker.is_none() {
            return Err(KernelError::invalid_argument(format!(
                "{} names no broker",
                record.reservation_id
            )));
        }
        if record.requested_resources.units == 0 {
            return Err(KernelError::invalid_argument(format!(
                "{} requests no units",
                record.reservation_id
            )));
        }
        self.authorize_slice(&record.slice_id, caller, Access::Reserve)?;
        self.kernel.register_reservation(record)
    }

    /// # Errors
    ///
    /// Access, state or store errors.
    pub fn remove_reservation(
        &mut self,
        rid: &ReservationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        self.kernel.remove_reservation(rid)
    }

    /// # Errors
    ///
    /// Access errors or the policy's refusal.
    pub fn demand(&mut self, rid: &ReservationId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        self.kernel.demand(rid)
    }

    /// # Errors
    ///
    /// Access errors or [`KernelError::InvalidState`].
    pub fn ticket(&mut self, rid: &ReservationId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.ticket(rid);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or [`KernelError::InvalidState`].
    pub fn claim(&mut self, rid: &ReservationId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.claim(rid);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors, [`KernelError::InvalidState`], or
    /// [`KernelError::InvalidArgument`] for a term that does not extend.
    pub fn extend_ticket(
        &mut self,
        rid: &ReservationId,
        term: Term,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.extend_ticket(rid, term);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or [`KernelError::InvalidState`].
    pub fn redeem(&mut self, rid: &ReservationId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.redeem(rid);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or [`KernelError::InvalidState`].
    pub fn extend_lease(
        &mut self,
        rid: &ReservationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.extend_lease(rid);
        self.commit(result)
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an empty change, access errors
    /// or [`KernelError::InvalidState`].
    pub fn modify_lease(
        &mut self,
        rid: &ReservationId,
        config: &BTreeMap<String, String>,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        if config.is_empty() {
            return Err(KernelError::invalid_argument("no configuration to change"));
        }
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.modify_lease(rid, config);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or [`KernelError::InvalidState`].
    pub fn close(&mut self, rid: &ReservationId, caller: &AuthToken) -> Result<(), KernelError> {
        self.authorize_reservation(rid, caller, Access::Reserve)?;
        let result = self.kernel.close(rid);
        self.commit(result)
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an empty request or a
    /// non-broker; access or store errors.
    pub fn export(
        &mut self,
        slice_id: SliceId,
        resources: ResourceSet,
        term: Term,
        claimant: ActorId,
        caller: &AuthToken,
    ) -> Result<ReservationId, KernelError> {
        if resources.units == 0 {
            return Err(KernelError::invalid_argument("export of zero units"));
        }
        self.authorize_slice(&slice_id, caller, Access::Reserve)?;
        let result = self.kernel.export(slice_id, resources, term, claimant);
        self.commit(result)
    }

    // === Delegations (local) ===

    /// Adds a delegation to be claimed from `record.peer`.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] unless the record is a holder with
    /// a peer; access or store errors.
    pub fn register_delegation(
        &mut self,
        record: DelegationRecord,
        caller: &AuthToken,
    ) -> Result<DelegationId, KernelError> {
        if record.role != DelegationRole::Holder || record.peer.is_none() {
            return Err(KernelError::invalid_argument(format!(
                "{} must be a holder naming its advertiser",
                record.delegation_id
            )));
        }
        self.authorize_slice(&record.slice_id, caller, Access::Reserve)?;
        self.kernel.register_delegation(record)
    }

    /// # Errors
    ///
    /// Access, state or store errors.
    pub fn remove_delegation(
        &mut self,
        did: &DelegationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_delegation(did, caller, Access::Reserve)?;
        self.kernel.remove_delegation(did)
    }

    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] for an empty graph or a
    /// non-authority; access or store errors.
    pub fn advertise(
        &mut self,
        slice_id: SliceId,
        name: &str,
        graph: String,
        holder: ActorId,
        caller: &AuthToken,
    ) -> Result<DelegationId, KernelError> {
        if graph.trim().is_empty() {
            return Err(KernelError::invalid_argument("empty delegation graph"));
        }
        self.authorize_slice(&slice_id, caller, Access::Reserve)?;
        let result = self.kernel.advertise(slice_id, name, graph, holder);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or the state machine's refusal.
    pub fn claim_delegation(
        &mut self,
        did: &DelegationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_delegation(did, caller, Access::Reserve)?;
        let result = self.kernel.claim_delegation(did);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors or the state machine's refusal.
    pub fn reclaim_delegation(
        &mut self,
        did: &DelegationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_delegation(did, caller, Access::Reserve)?;
        let result = self.kernel.reclaim_delegation(did);
        self.commit(result)
    }

    /// # Errors
    ///
    /// Access errors.
    pub fn close_delegation(
        &mut self,
        did: &DelegationId,
        caller: &AuthToken,
    ) -> Result<(), KernelError> {
        self.authorize_delegation(did, caller, Access::Reserve)?;
        let result = self.kernel.close_delegation(did);
        self.commit(result)
    }

    // === Inbound ===

    /// Routes one inbound message.
    ///
    /// # Errors
    ///
    /// Validation errors (wrong payload, unknown object, access denied,
    /// wrong role) and store errors. The caller decides whether to
    /// [`reject`](Self::rejection) the message.
    pub fn process(&mut self, message: &RpcMessage) -> Result<(), KernelError> {
        debug!("inbound {}", message);
        let result = self.route(message);
        self.commit(result)
    }

    fn route(&mut self, message: &RpcMessage) -> Result<(), KernelError> {
        if message.kind.is_sequenced() && message.sequence == 0 {
            return Err(KernelError::invalid_argument(format!(
                "{} carries sequence 0",
                message.kind
            )));
        }
        let caller = &message.caller;
        match message.kind {
            RpcRequestType::Ticket | RpcRequestType::Redeem => {
                let wire = message.reservation()?;
                match self.kernel.reservation(&wire.reservation_id) {
                    Some(_) => {
                        self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                    }
                    None if self.kernel.slice(&wire.slice_id).is_some() => {
                        self.authorize_slice(&wire.slice_id, caller, Access::Reserve)?;
                    }
                    None => {}
                }
                self.kernel.issue_request(message, wire)
            }
            RpcRequestType::ExtendTicket | RpcRequestType::ExtendLease => {
                let wire = message.reservation()?;
                self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                self.kernel.extend_request(message, wire)
            }
            RpcRequestType::ClaimTicket => {
                let wire = message.reservation()?;
                self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                self.kernel.claim_request(message, wire)
            }
            RpcRequestType::ModifyLease => {
                let wire = message.reservation()?;
                self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                self.kernel.modify_lease_request(message, wire)
            }
            RpcRequestType::Close => {
                let wire = message.reservation()?;
                self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                self.kernel.close_request(message, wire)
            }
            RpcRequestType::Relinquish => match &message.payload {
                RpcPayload::Delegation(wire) => {
                    self.authorize_delegation(&wire.delegation_id, caller, Access::Reserve)?;
                    self.kernel.relinquish_delegation_request(message, wire)
                }
                _ => {
                    let wire = message.reservation()?;
                    self.authorize_reservation(&wire.reservation_id, caller, Access::Reserve)?;
                    self.kernel.relinquish_request(message, wire)
                }
            },
            RpcRequestType::UpdateTicket | RpcRequestType::UpdateLease => {
                let wire = message.reservation()?;
                self.authorize_reservation(&wire.reservation_id, caller, Access::Update)?;
                self.kernel.update_request(message, wire)
            }
            RpcRequestType::ClaimDelegation => {
                let wire = message.delegation()?;
                self.authorize_delegation(&wire.delegation_id, caller, Access::Reserve)?;
                self.kernel.claim_delegation_request(message, wire)
            }
            RpcRequestType::UpdateDelegation | RpcRequestType::ReclaimDelegation => {
                let wire = message.delegation()?;
                self.authorize_delegation(&wire.delegation_id, caller, Access::Update)?;
                self.kernel.update_delegation_request(message, wire)
            }
            RpcRequestType::Query => {
                self.kernel.query_request(message);
                Ok(())
            }
            RpcRequestType::QueryResult => {
                debug!("query result {} matched no pending query", message.message_id);
                Ok(())
            }
            RpcRequestType::FailedRpc => {
                let failure = message.failure()?;
                self.kernel.handle_failed_rpc(failure);
                Ok(())
            }
        }
    }

    /// `FailedRpc` answering `message`, or `None` when the message must not
    /// be answered: notices and results are never rejected, and a store
    /// error is left for the peer's timeout.
    #[must_use]
    pub fn rejection(&self, message: &RpcMessage, err: &KernelError) -> Option<RpcMessage> {
        if matches!(
            message.kind,
            RpcRequestType::FailedRpc | RpcRequestType::QueryResult
        ) {
            return None;
        }
        if matches!(err, KernelError::Store(_)) {
            error!("{} not processed: {}", message, err);
            return None;
        }
        let failure =
            RpcFailure::new(FailureKind::Rejected, message, err.to_string()).with_code(err.code());
        Some(message.reject(self.identity().clone(), failure))
    }

    /// Local delivery failure or a peer's rejection.
    ///
    /// # Errors
    ///
    /// A store error from the commit.
    pub fn handle_failed_rpc(&mut self, failure: &RpcFailure) -> Result<(), KernelError> {
        self.kernel.handle_failed_rpc(failure);
        self.kernel.commit()
    }

    // === Lifecycle ===

    /// # Errors
    ///
    /// A store error from the commit.
    pub fn tick(&mut self, cycle: u64) -> Result<(), KernelError> {
        self.kernel.tick_role(cycle)
    }

    /// # Errors
    ///
    /// A store error while loading or committing.
    pub fn recover(&mut self) -> Result<(), KernelError> {
        self.kernel.recover()
    }

    #[must_use]
    pub fn query(&self) -> BTreeMap<String, String> {
        self.kernel.query()
    }

    #[must_use]
    pub fn role(&self) -> ActorRole {
        self.kernel.role()
    }

    /// Blocks until no request awaits a response, or `timeout` passes.
    /// Returns whether the queue drained.
    #[must_use]
    pub fn await_nothing_pending(&self, timeout: Duration) -> bool {
        self.kernel.rpc().await_nothing_pending(timeout)
    }
}

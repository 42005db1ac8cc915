//! Delegation operations.

use super::Kernel;
use crate::delegation::{DelegationRecord, DelegationRole};
use crate::error::{KernelError, ObjectKind};
use leasehold_auth::Permission;
use leasehold_event::{DelegationWire, RpcMessage, RpcRequestType};
use leasehold_types::{
    compare_sequence, ActorId, ActorRole, DelegationId, DelegationState, SequenceComparison,
    SliceId,
};
use tracing::{debug, warn};

impl Kernel {
    fn arbitrate_delegation(
        &mut self,
        did: &DelegationId,
        message: &RpcMessage,
    ) -> Result<SequenceComparison, KernelError> {
        let delegation = self
            .delegations
            .get_mut(did)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Delegation, did))?;
        let last = delegation.record().sequence_in;
        let verdict = compare_sequence(message.sequence, last, false);
        match verdict {
            SequenceComparison::Greater => {
                delegation.record_mut().sequence_in = message.sequence;
                delegation.mark_dirty();
            }
            SequenceComparison::Equal => {
                debug!(did = %did, "duplicate {} seq={}", message.kind, message.sequence);
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {
                warn!(
                    did = %did,
                    "stale {} seq={} (last {}); dropped", message.kind, message.sequence, last
                );
            }
        }
        Ok(verdict)
    }

    // === Local ===

    /// Offers a pool to `holder`. The policy decides whether the inventory
    /// can back it; a refusal fails the new delegation.
    ///
    /// # Errors
    ///
    /// [`KernelError::InvalidArgument`] on a non-authority,
    /// [`KernelError::NotFound`] for an unknown slice, or a store error.
    pub fn advertise(
        &mut self,
        slice_id: SliceId,
        name: &str,
        graph: String,
        holder: ActorId,
    ) -> Result<DelegationId, KernelError> {
        if self.role != ActorRole::Authority {
            return Err(KernelError::invalid_argument(format!(
                "a {} cannot advertise delegations",
                self.role
            )));
        }
        let slice_name = self
            .slices
            .get(&slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))?
            .name()
            .to_string();
        let mut record = DelegationRecord::new(
            DelegationId::new(),
            name,
            DelegationRole::Advertiser,
            slice_id,
            slice_name,
        );
        record.graph = Some(graph);
        let did = self.register_delegation(record)?;
        self.grant(&slice_id, &[holder], Permission::RESERVE | Permission::UPDATE)?;
        self.with_delegation(&did, |d, ctx| d.map_and_update(false, ctx))?;
        Ok(did)
    }

    /// Holder side: asks the advertiser for the pool.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] or the state machine's refusal.
    pub fn claim_delegation(&mut self, did: &DelegationId) -> Result<(), KernelError> {
        self.with_delegation(did, |d, ctx| {
            if d.role() != DelegationRole::Holder {
                return Err(KernelError::invalid_argument(format!(
                    "{did} is advertised, not held, here"
                )));
            }
            d.delegate(ctx)
        })??;
        let (slice_id, peer) = match self.delegations.get(did) {
            Some(d) => (d.slice_id(), d.record().peer),
            None => return Ok(()),
        };
        if let Some(peer) = peer {
            self.grant(&slice_id, &[peer], Permission::UPDATE)?;
        }
        Ok(())
    }

    /// Advertiser side: takes the pool back.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] or the state machine's refusal.
    pub fn reclaim_delegation(&mut self, did: &DelegationId) -> Result<(), KernelError> {
        self.with_delegation(did, |d, ctx| {
            if d.role() != DelegationRole::Advertiser {
                return Err(KernelError::invalid_argument(format!(
                    "{did} is held, not advertised, here"
                )));
            }
            d.reclaim(ctx)
        })?
    }

    /// Holder side: gives the pool back and closes. A second close does
    /// nothing.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`] or a send error.
    pub fn close_delegation(&mut self, did: &DelegationId) -> Result<(), KernelError> {
        self.with_delegation(did, |d, ctx| d.close(ctx))?
    }

    // === Inbound ===

    /// A holder claims an advertised pool.
    ///
    /// # Errors
    ///
    /// Validation errors for the wrong role, an unknown delegation or a
    /// missing callback.
    pub fn claim_delegation_request(
        &mut self,
        message: &RpcMessage,
        wire: &DelegationWire,
    ) -> Result<(), KernelError> {
        if self.role != ActorRole::Authority {
            return Err(KernelError::invalid_argument(format!(
                "{} is not served by a {}",
                message.kind, self.role
            )));
        }
        let callback = message.require_callback()?;
        let did = wire.delegation_id;
        match self.arbitrate_delegation(&did, message)? {
            SequenceComparison::Greater => {
                self.with_delegation(&did, |d, _| d.claim(callback, message.message_id))?;
            }
            SequenceComparison::Equal => {
                self.with_delegation(&did, |d, _| {
                    if d.state() == DelegationState::Delegated && !d.record().update_pending {
                        d.record_mut().update_pending = true;
                        d.mark_dirty();
                    }
                })?;
            }
            SequenceComparison::Smaller | SequenceComparison::InProgress => {}
        }
        Ok(())
    }

    /// `UpdateDelegation` or `ReclaimDelegation` from the advertiser.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], or [`KernelError::InvalidArgument`] when
    /// the delegation is not held here.
    pub fn update_delegation_request(
        &mut self,
        message: &RpcMessage,
        wire: &DelegationWire,
    ) -> Result<(), KernelError> {
        let did = wire.delegation_id;
        let held = self
            .delegations
            .get(&did)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Delegation, did))?
            .role()
            == DelegationRole::Holder;
        if !held {
            return Err(KernelError::invalid_argument(format!(
                "{} for {did}, which is not held here",
                message.kind
            )));
        }
        if self.arbitrate_delegation(&did, message)? != SequenceComparison::Greater {
            return Ok(());
        }
        let mut wire = wire.clone();
        if message.kind == RpcRequestType::ReclaimDelegation {
            wire.graph = None;
        }
        self.with_delegation(&did, |d, ctx| d.update_delegation(&wire, ctx))
    }

    /// The holder handed the pool back.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`].
    pub fn relinquish_delegation_request(
        &mut self,
        message: &RpcMessage,
        wire: &DelegationWire,
    ) -> Result<(), KernelError> {
        let did = wire.delegation_id;
        if self.arbitrate_delegation(&did, message)? == SequenceComparison::Greater {
            self.with_delegation(&did, |d, ctx| d.relinquish_received(ctx))?;
        }
        Ok(())
    }
}

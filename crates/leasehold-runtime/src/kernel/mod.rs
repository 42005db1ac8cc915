//! Kernel.
//!
//! The [`Kernel`] owns every slice, reservation and delegation an actor
//! knows about, together with the policy, the store and the RPC manager.
//! It is single-threaded: the actor loop is the only caller, one event at
//! a time, so no state machine ever needs a lock.
//!
//! # Commit
//!
//! Operations mutate records in memory and queue outbound messages. The
//! caller then runs [`Kernel::commit`]:
//!
//! ```text
//! dirty reservations ─► store.update_reservation ─┐
//! dirty delegations  ─► store.update_delegation  ─┤ all succeeded?
//!                                                 └─► outbox ─► RpcManager::dispatch
//! ```
//!
//! A failed write leaves the remaining records dirty and the outbox
//! untouched; the next commit retries both.
//!
//! [`KernelWrapper`] is the validated front door. It checks arguments and
//! slice access before forwarding here.

mod delegations;
mod reservations;
mod wrapper;

pub use wrapper::KernelWrapper;

use crate::actor::ActorClock;
use crate::context::{OpContext, Outbound, Outbox};
use crate::delegation::{Delegation, DelegationRecord};
use crate::error::{KernelError, ObjectKind};
use crate::policy::Policy;
use crate::reservation::{Reservation, ReservationRecord, ReservationRole};
use crate::rpc::RpcManager;
use crate::slice::Slice;
use crate::store::ActorStore;
use leasehold_event::{RpcFailure, RpcMessage, RpcPayload, RpcRequestType};
use leasehold_types::{
    ActorRole, AuthToken, DelegationId, ReservationId, ReservationPendingState, ReservationState,
    SliceId, SliceKind,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-actor state and the operations on it.
pub struct Kernel {
    identity: AuthToken,
    role: ActorRole,
    clock: ActorClock,
    cycle: u64,
    policy: Box<dyn Policy>,
    store: Arc<dyn ActorStore>,
    rpc: RpcManager,
    outbox: Outbox,
    slices: HashMap<SliceId, Slice>,
    reservations: HashMap<ReservationId, Reservation>,
    delegations: HashMap<DelegationId, Delegation>,
}

impl Kernel {
    #[must_use]
    pub fn new(
        role: ActorRole,
        clock: ActorClock,
        policy: Box<dyn Policy>,
        store: Arc<dyn ActorStore>,
        rpc: RpcManager,
    ) -> Self {
        Self {
            identity: rpc.identity().clone(),
            role,
            clock,
            cycle: 0,
            policy,
            store,
            rpc,
            outbox: Outbox::new(),
            slices: HashMap::new(),
            reservations: HashMap::new(),
            delegations: HashMap::new(),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &AuthToken {
        &self.identity
    }

    #[must_use]
    pub fn role(&self) -> ActorRole {
        self.role
    }

    #[must_use]
    pub fn clock(&self) -> &ActorClock {
        &self.clock
    }

    /// Last cycle the kernel ticked.
    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn rpc(&self) -> &RpcManager {
        &self.rpc
    }

    #[must_use]
    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ActorStore> {
        &self.store
    }

    /// Messages queued but not yet flushed.
    #[must_use]
    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    #[must_use]
    pub fn slice(&self, slice_id: &SliceId) -> Option<&Slice> {
        self.slices.get(slice_id)
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.slices.values()
    }

    #[must_use]
    pub fn reservation(&self, rid: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(rid)
    }

    pub fn reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values()
    }

    #[must_use]
    pub fn delegation(&self, did: &DelegationId) -> Option<&Delegation> {
        self.delegations.get(did)
    }

    pub fn delegations(&self) -> impl Iterator<Item = &Delegation> {
        self.delegations.values()
    }

    pub(crate) fn slice_mut(&mut self, slice_id: &SliceId) -> Result<&mut Slice, KernelError> {
        self.slices
            .get_mut(slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))
    }

    /// Runs `f` on one reservation with an operation context built from
    /// the kernel's other fields.
    pub(crate) fn with_reservation<T>(
        &mut self,
        rid: &ReservationId,
        f: impl FnOnce(&mut Reservation, &mut OpContext<'_>) -> T,
    ) -> Result<T, KernelError> {
        let reservation = self
            .reservations
            .get_mut(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?;
        let mut ctx = OpContext {
            policy: self.policy.as_mut(),
            outbox: &mut self.outbox,
            clock: &self.clock,
            identity: &self.identity,
            cycle: self.cycle,
        };
        Ok(f(reservation, &mut ctx))
    }

    pub(crate) fn with_delegation<T>(
        &mut self,
        did: &DelegationId,
        f: impl FnOnce(&mut Delegation, &mut OpContext<'_>) -> T,
    ) -> Result<T, KernelError> {
        let delegation = self
            .delegations
            .get_mut(did)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Delegation, did))?;
        let mut ctx = OpContext {
            policy: self.policy.as_mut(),
            outbox: &mut self.outbox,
            clock: &self.clock,
            identity: &self.identity,
            cycle: self.cycle,
        };
        Ok(f(delegation, &mut ctx))
    }

    // === Registration ===

    /// Adds a slice and persists it.
    ///
    /// # Errors
    ///
    /// [`KernelError::AlreadyRegistered`] for a known id, or a store error.
    pub fn register_slice(&mut self, slice: Slice) -> Result<(), KernelError> {
        let slice_id = slice.slice_id();
        if self.slices.contains_key(&slice_id) {
            return Err(KernelError::already_registered(ObjectKind::Slice, slice_id));
        }
        self.store.add_slice(&slice)?;
        debug!(slice = %slice_id, name = slice.name(), "slice registered");
        self.slices.insert(slice_id, slice);
        Ok(())
    }

    /// Returns the slice with this id, creating it owned by `owner` if it
    /// does not exist yet. Calling it twice for the same id is harmless.
    ///
    /// # Errors
    ///
    /// A store error if a new slice could not be persisted.
    pub fn get_or_create_local_slice(
        &mut self,
        slice_id: SliceId,
        name: &str,
        owner: &AuthToken,
        kind: SliceKind,
    ) -> Result<&Slice, KernelError> {
        if !self.slices.contains_key(&slice_id) {
            let slice = Slice::with_id(slice_id, name, owner.clone(), kind);
            self.store.add_slice(&slice)?;
            info!(slice = %slice_id, name, owner = %owner, "created slice for peer");
            self.slices.insert(slice_id, slice);
        }
        self.slices
            .get(&slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))
    }

    /// Removes an empty slice.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], [`KernelError::InvalidState`] while the
    /// slice still has members, or a store error.
    pub fn remove_slice(&mut self, slice_id: &SliceId) -> Result<(), KernelError> {
        let slice = self
            .slices
            .get(slice_id)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Slice, slice_id))?;
        if !slice.is_empty() {
            return Err(KernelError::invalid_state(format!(
                "slice {slice_id} still has members"
            )));
        }
        self.store.remove_slice(slice_id)?;
        self.slices.remove(slice_id);
        Ok(())
    }

    /// Adds a reservation to its slice. The record is written before it
    /// becomes visible.
    ///
    /// # Errors
    ///
    /// [`KernelError::AlreadyRegistered`], [`KernelError::NotFound`] when
    /// the slice is unknown, or a store error.
    pub fn register_reservation(
        &mut self,
        record: ReservationRecord,
    ) -> Result<ReservationId, KernelError> {
        let rid = record.reservation_id;
        if self.reservations.contains_key(&rid) {
            return Err(KernelError::already_registered(ObjectKind::Reservation, rid));
        }
        let slice_id = record.slice_id;
        if !self.slices.contains_key(&slice_id) {
            return Err(KernelError::not_found(ObjectKind::Slice, slice_id));
        }
        self.store.add_reservation(&record)?;
        let slice = self.slice_mut(&slice_id)?;
        if slice.add_reservation(rid) {
            let snapshot = slice.clone();
            self.store.update_slice(&snapshot)?;
        }
        debug!(rid = %rid, role = %record.role, "reservation registered");
        self.reservations.insert(rid, Reservation::restore(record));
        Ok(rid)
    }

    /// Drops a terminal reservation.
    ///
    /// # Errors
    ///
    /// [`KernelError::NotFound`], [`KernelError::InvalidState`] unless the
    /// reservation is closed or failed, or a store error.
    pub fn remove_reservation(&mut self, rid: &ReservationId) -> Result<(), KernelError> {
        let reservation = self
            .reservations
            .get(rid)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Reservation, rid))?;
        if !reservation.record().is_removable() {
            return Err(KernelError::invalid_state(format!(
                "{rid} is [{}], not removable",
                reservation.state()
            )));
        }
        let slice_id = reservation.slice_id();
        self.store.remove_reservation(rid)?;
        self.reservations.remove(rid);
        if let Some(slice) = self.slices.get_mut(&slice_id) {
            if slice.remove_reservation(rid) {
                let snapshot = slice.clone();
                self.store.update_slice(&snapshot)?;
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Same rules as [`Kernel::register_reservation`].
    pub fn register_delegation(
        &mut self,
        record: DelegationRecord,
    ) -> Result<DelegationId, KernelError> {
        let did = record.delegation_id;
        if self.delegations.contains_key(&did) {
            return Err(KernelError::already_registered(ObjectKind::Delegation, did));
        }
        let slice_id = record.slice_id;
        if !self.slices.contains_key(&slice_id) {
            return Err(KernelError::not_found(ObjectKind::Slice, slice_id));
        }
        self.store.add_delegation(&record)?;
        let slice = self.slice_mut(&slice_id)?;
        if slice.add_delegation(did) {
            let snapshot = slice.clone();
            self.store.update_slice(&snapshot)?;
        }
        debug!(did = %did, role = %record.role, "delegation registered");
        self.delegations.insert(did, Delegation::restore(record));
        Ok(did)
    }

    /// # Errors
    ///
    /// Same rules as [`Kernel::remove_reservation`].
    pub fn remove_delegation(&mut self, did: &DelegationId) -> Result<(), KernelError> {
        let delegation = self
            .delegations
            .get(did)
            .ok_or_else(|| KernelError::not_found(ObjectKind::Delegation, did))?;
        if !delegation.record().is_removable() {
            return Err(KernelError::invalid_state(format!(
                "{did} is [{}], not removable",
                delegation.state()
            )));
        }
        let slice_id = delegation.slice_id();
        self.store.remove_delegation(did)?;
        self.delegations.remove(did);
        if let Some(slice) = self.slices.get_mut(&slice_id) {
            if slice.remove_delegation(did) {
                let snapshot = slice.clone();
                self.store.update_slice(&snapshot)?;
            }
        }
        Ok(())
    }

    // === Commit ===

    /// Persists dirty records, then hands queued messages to the RPC
    /// manager.
    ///
    /// # Errors
    ///
    /// The first store error. Nothing is sent in that case.
    pub fn commit(&mut self) -> Result<(), KernelError> {
        for reservation in self.reservations.values_mut() {
            if reservation.core().is_dirty() {
                self.store.update_reservation(reservation.record())?;
                reservation.core_mut().clear_dirty();
            }
        }
        for delegation in self.delegations.values_mut() {
            if delegation.is_dirty() {
                self.store.update_delegation(delegation.record())?;
                delegation.clear_dirty();
            }
        }
        for outbound in self.outbox.drain() {
            let to = outbound.to;
            self.rpc.dispatch(to, outbound.into_message(&self.identity));
        }
        Ok(())
    }

    // === Tick ===

    /// Applies the decisions an issuer policy reached since the last tick.
    pub fn allocate(&mut self, cycle: u64) {
        let decisions = if let Some(broker) = self.policy.as_broker_mut() {
            broker.allocate(cycle)
        } else if let Some(authority) = self.policy.as_authority_mut() {
            authority.allocate(cycle)
        } else {
            Vec::new()
        };
        for decision in decisions {
            let rid = decision.reservation_id;
            match self.reservations.get_mut(&rid) {
                Some(reservation) => reservation.apply_decision(decision.outcome),
                None => debug!(rid = %rid, "decision for unknown reservation; dropped"),
            }
        }
    }

    /// Reservations and delegations the policy wants closed this cycle.
    pub(crate) fn closing(&mut self, cycle: u64) -> Vec<ReservationId> {
        self.policy.get_closing(cycle, &self.clock)
    }

    /// One kernel cycle: probe whatever owes a message, then commit.
    ///
    /// # Errors
    ///
    /// A store error from the closing commit.
    pub fn tick(&mut self, cycle: u64) -> Result<(), KernelError> {
        self.cycle = cycle;
        self.policy.prepare(cycle);

        let mut probing: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| r.needs_probe())
            .map(|r| r.core().reservation_id())
            .collect();
        probing.sort();
        for rid in &probing {
            self.with_reservation(rid, |r, ctx| r.probe(ctx))?;
        }

        let mut owing: Vec<DelegationId> = self
            .delegations
            .values()
            .filter(|d| d.needs_probe())
            .map(Delegation::delegation_id)
            .collect();
        owing.sort();
        for did in &owing {
            self.with_delegation(did, |d, ctx| d.probe_pending(ctx))?;
        }

        self.policy.finish(cycle);
        self.commit()
    }

    /// Runs the role's tick handler, then [`Kernel::tick`].
    ///
    /// # Errors
    ///
    /// A store error from the commit.
    pub fn tick_role(&mut self, cycle: u64) -> Result<(), KernelError> {
        self.cycle = cycle;
        match self.role {
            ActorRole::Controller => self.tick_controller(cycle),
            ActorRole::Broker | ActorRole::Authority => {
                self.allocate(cycle);
                self.close_expired(cycle);
            }
        }
        self.tick(cycle)
    }

    fn tick_controller(&mut self, cycle: u64) {
        for rid in self.closing(cycle) {
            if let Err(e) = self.close(&rid) {
                warn!(rid = %rid, "scheduled close failed: {}", e);
            }
        }

        let Some(client) = self.policy.as_client_mut() else {
            warn!("controller policy {} has no client half", self.policy.name());
            return;
        };
        let redeeming = client.get_redeeming(cycle, &self.clock);
        let bids = client.formulate_bids(cycle, &self.clock);

        for rid in redeeming {
            let extending = self
                .reservations
                .get(&rid)
                .is_some_and(|r| r.state() == ReservationState::ActiveTicketed);
            let result = if extending {
                self.extend_lease(&rid)
            } else {
                self.redeem(&rid)
            };
            if let Err(e) = result {
                warn!(rid = %rid, "redeem failed: {}", e);
            }
        }
        for rid in bids.ticketing {
            if let Err(e) = self.ticket(&rid) {
                warn!(rid = %rid, "ticket failed: {}", e);
            }
        }
        for (rid, term) in bids.extending {
            if let Err(e) = self.extend_ticket(&rid, term) {
                warn!(rid = %rid, "extend ticket failed: {}", e);
            }
        }
    }

    fn close_expired(&mut self, cycle: u64) {
        for rid in self.closing(cycle) {
            if let Err(e) = self.with_reservation(&rid, |r, ctx| r.close_issued(ctx)) {
                debug!(rid = %rid, "expiry close skipped: {}", e);
            }
        }
    }

    // === Failures ===

    /// Routes a failed RPC to the record it was about.
    pub fn handle_failed_rpc(&mut self, failure: &RpcFailure) {
        if let Some(rid) = failure.reservation_id {
            match self.reservations.get_mut(&rid) {
                Some(r) => r.handle_failed_rpc(failure),
                None => debug!(rid = %rid, "failure for unknown reservation: {}", failure.message),
            }
        } else if let Some(did) = failure.delegation_id {
            match self.delegations.get_mut(&did) {
                Some(d) => d.handle_failed_rpc(failure),
                None => debug!(did = %did, "failure for unknown delegation: {}", failure.message),
            }
        } else {
            warn!(
                "{} failed ({}) with no target: {}",
                failure.request_type, failure.kind, failure.message
            );
        }
    }

    // === Recovery ===

    /// Loads everything from the store and resumes interrupted operations.
    /// Meant for a fresh kernel; records already in memory are kept.
    ///
    /// # Errors
    ///
    /// A store error while loading or committing.
    pub fn recover(&mut self) -> Result<(), KernelError> {
        for slice in self.store.slices()? {
            self.slices.entry(slice.slice_id()).or_insert(slice);
        }

        let mut rids = Vec::new();
        for record in self.store.reservations()? {
            if self.reservations.contains_key(&record.reservation_id) {
                continue;
            }
            self.policy.revisit(&record);
            rids.push(record.reservation_id);
            self.reservations
                .insert(record.reservation_id, Reservation::restore(record));
        }

        let mut dids = Vec::new();
        for record in self.store.delegations()? {
            if self.delegations.contains_key(&record.delegation_id) {
                continue;
            }
            self.policy.revisit_delegation(&record);
            dids.push(record.delegation_id);
            self.delegations
                .insert(record.delegation_id, Delegation::restore(record));
        }

        rids.sort();
        for rid in &rids {
            self.with_reservation(rid, |r, ctx| r.recover(ctx))?;
        }
        dids.sort();
        for did in &dids {
            self.with_delegation(did, |d, ctx| d.recover(ctx))?;
        }

        info!(
            slices = self.slices.len(),
            reservations = rids.len(),
            delegations = dids.len(),
            "recovered"
        );
        self.commit()
    }

    // === Query ===

    /// Actor summary plus whatever the policy reports under `policy.`.
    #[must_use]
    pub fn query(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        out.insert("actor".to_string(), self.identity.name.clone());
        out.insert("role".to_string(), self.role.to_string());
        out.insert("cycle".to_string(), self.cycle.to_string());
        out.insert("slices".to_string(), self.slices.len().to_string());
        out.insert(
            "reservations".to_string(),
            self.reservations.len().to_string(),
        );
        out.insert("delegations".to_string(), self.delegations.len().to_string());

        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        for r in self.reservations.values() {
            *by_state.entry(r.state().to_string()).or_default() += 1;
        }
        for (state, count) in by_state {
            out.insert(format!("reservations.{state}"), count.to_string());
        }
        let pending = self
            .reservations
            .values()
            .filter(|r| r.core().pending() != ReservationPendingState::None)
            .count();
        out.insert("reservations.pending".to_string(), pending.to_string());

        for (key, value) in self.policy.query() {
            out.insert(format!("policy.{key}"), value);
        }
        out
    }

    /// Queues a `QueryResult` answering a peer's `Query`.
    pub fn query_request(&mut self, message: &RpcMessage) {
        let answer = Outbound::new(
            RpcRequestType::QueryResult,
            message.reply_target(),
            0,
            RpcPayload::QueryResult(self.query()),
        )
        .in_reply_to(Some(message.message_id));
        self.outbox.push(answer);
    }

    /// Role a reservation created for an inbound request takes here.
    pub(crate) fn issuer_role(&self) -> Result<(ReservationRole, SliceKind), KernelError> {
        match self.role {
            ActorRole::Broker => Ok((ReservationRole::Broker, SliceKind::BrokerClient)),
            ActorRole::Authority => Ok((ReservationRole::Authority, SliceKind::Client)),
            ActorRole::Controller => Err(KernelError::invalid_argument(
                "a controller does not issue reservations",
            )),
        }
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("identity", &self.identity)
            .field("role", &self.role)
            .field("cycle", &self.cycle)
            .field("policy", &self.policy.name())
            .field("slices", &self.slices.len())
            .field("reservations", &self.reservations.len())
            .field("delegations", &self.delegations.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actor::ActorEvent;
    use crate::config::RpcConfig;
    use crate::policy::{SimpleClientPolicy, UnitAuthorityPolicy, UnitBrokerPolicy};
    use crate::store::{MemoryStore, StoreError};
    use crate::testing::hour_term;
    use chrono::Utc;
    use leasehold_event::{DelegationWire, FailureKind, ReservationWire};
    use leasehold_types::{ActorId, ResourceSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    pub(crate) type Events = mpsc::UnboundedReceiver<ActorEvent>;

    fn kernel(name: &str, role: ActorRole, policy: Box<dyn Policy>, store: Arc<dyn ActorStore>) -> (Kernel, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        let rpc = RpcManager::new(AuthToken::named(name), RpcConfig::default(), tx);
        let clock = ActorClock::new(Utc::now(), 1_000);
        (Kernel::new(role, clock, policy, store, rpc), rx)
    }

    pub(crate) fn client_kernel() -> (Kernel, Events) {
        kernel(
            "ctl",
            ActorRole::Controller,
            Box::new(SimpleClientPolicy::new()),
            Arc::new(MemoryStore::new()),
        )
    }

    pub(crate) fn broker_kernel(units: u32) -> (Kernel, Events) {
        let policy = UnitBrokerPolicy::new(ActorId::named("broker")).with_inventory(
            "vm",
            units,
            Some(ActorId::named("site")),
        );
        kernel(
            "broker",
            ActorRole::Broker,
            Box::new(policy),
            Arc::new(MemoryStore::new()),
        )
    }

    pub(crate) fn authority_kernel(units: u32) -> (Kernel, Events) {
        let policy = UnitAuthorityPolicy::new(ActorId::named("site")).with_inventory("vm", units);
        kernel(
            "site",
            ActorRole::Authority,
            Box::new(policy),
            Arc::new(MemoryStore::new()),
        )
    }

    pub(crate) fn request(
        kind: RpcRequestType,
        caller: &AuthToken,
        sequence: u64,
        wire: &ReservationWire,
    ) -> RpcMessage {
        RpcMessage::new(kind, caller.clone(), RpcPayload::Reservation(wire.clone()))
            .with_sequence(sequence)
            .with_callback(caller.guid)
    }

    pub(crate) fn delegation_request(
        kind: RpcRequestType,
        caller: &AuthToken,
        sequence: u64,
        wire: &DelegationWire,
    ) -> RpcMessage {
        RpcMessage::new(kind, caller.clone(), RpcPayload::Delegation(wire.clone()))
            .with_sequence(sequence)
            .with_callback(caller.guid)
    }

    /// Memory store whose reservation writes can be switched off.
    struct FlakyStore {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                Err(StoreError::Io(std::io::Error::other("disk full")))
            } else {
                Ok(())
            }
        }
    }

    impl ActorStore for FlakyStore {
        fn add_slice(&self, slice: &Slice) -> Result<(), StoreError> {
            self.inner.add_slice(slice)
        }
        fn update_slice(&self, slice: &Slice) -> Result<(), StoreError> {
            self.inner.update_slice(slice)
        }
        fn remove_slice(&self, id: &SliceId) -> Result<(), StoreError> {
            self.inner.remove_slice(id)
        }
        fn slices(&self) -> Result<Vec<Slice>, StoreError> {
            self.inner.slices()
        }
        fn add_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.add_reservation(record)
        }
        fn update_reservation(&self, record: &ReservationRecord) -> Result<(), StoreError> {
            self.check()?;
            self.inner.update_reservation(record)
        }
        fn remove_reservation(&self, id: &ReservationId) -> Result<(), StoreError> {
            self.inner.remove_reservation(id)
        }
        fn get_reservation(
            &self,
            id: &ReservationId,
        ) -> Result<Option<ReservationRecord>, StoreError> {
            self.inner.get_reservation(id)
        }
        fn reservations(&self) -> Result<Vec<ReservationRecord>, StoreError> {
            self.inner.reservations()
        }
        fn add_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
            self.inner.add_delegation(record)
        }
        fn update_delegation(&self, record: &DelegationRecord) -> Result<(), StoreError> {
            self.inner.update_delegation(record)
        }
        fn remove_delegation(&self, id: &DelegationId) -> Result<(), StoreError> {
            self.inner.remove_delegation(id)
        }
        fn delegations(&self) -> Result<Vec<DelegationRecord>, StoreError> {
            self.inner.delegations()
        }
    }

    fn client_reservation(kernel: &mut Kernel) -> ReservationId {
        let slice = Slice::new("web", kernel.identity().clone(), SliceKind::Client);
        let slice_id = slice.slice_id();
        kernel.register_slice(slice).unwrap();
        let mut record = ReservationRecord::new(
            ReservationRole::Client,
            slice_id,
            "web",
            ResourceSet::new(2, "vm"),
            Some(hour_term()),
        );
        record.broker = Some(ActorId::named("broker"));
        kernel.register_reservation(record).unwrap()
    }

    #[test]
    fn registration_rules() {
        let (mut kernel, _rx) = client_kernel();
        let slice = Slice::new("web", kernel.identity().clone(), SliceKind::Client);
        let again = slice.clone();
        kernel.register_slice(slice).unwrap();
        assert!(matches!(
            kernel.register_slice(again),
            Err(KernelError::AlreadyRegistered { .. })
        ));

        let orphan = ReservationRecord::new(
            ReservationRole::Client,
            SliceId::new(),
            "nowhere",
            ResourceSet::new(1, "vm"),
            None,
        );
        assert!(matches!(
            kernel.register_reservation(orphan),
            Err(KernelError::NotFound { kind: ObjectKind::Slice, .. })
        ));
    }

    #[test]
    fn only_terminal_reservations_are_removed() {
        let (mut kernel, _rx) = client_kernel();
        let rid = client_reservation(&mut kernel);
        assert!(matches!(
            kernel.remove_reservation(&rid),
            Err(KernelError::InvalidState(_))
        ));
        kernel.close(&rid).unwrap();
        kernel.remove_reservation(&rid).unwrap();
        assert!(kernel.reservation(&rid).is_none());
        let slice = kernel.slices().next().unwrap().slice_id();
        kernel.remove_slice(&slice).unwrap();
    }

    #[test]
    fn local_slice_creation_is_idempotent() {
        let (mut kernel, _rx) = broker_kernel(1);
        let ctl = AuthToken::named("ctl");
        let id = SliceId::new();
        kernel
            .get_or_create_local_slice(id, "web", &ctl, SliceKind::BrokerClient)
            .unwrap();
        let other = AuthToken::named("other");
        let slice = kernel
            .get_or_create_local_slice(id, "web", &other, SliceKind::BrokerClient)
            .unwrap();
        assert_eq!(slice.owner(), &ctl);
        assert_eq!(kernel.slices().count(), 1);
    }

    #[test]
    fn failed_commit_keeps_messages_queued() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            broken: AtomicBool::new(false),
        });
        let (mut kernel, _rx) = kernel(
            "ctl",
            ActorRole::Controller,
            Box::new(SimpleClientPolicy::new()),
            store.clone(),
        );
        let rid = client_reservation(&mut kernel);
        kernel.ticket(&rid).unwrap();

        store.broken.store(true, Ordering::SeqCst);
        assert!(matches!(kernel.commit(), Err(KernelError::Store(_))));
        assert_eq!(kernel.outbox().len(), 1);
        assert!(kernel.reservation(&rid).unwrap().core().is_dirty());

        store.broken.store(false, Ordering::SeqCst);
        kernel.commit().unwrap();
        assert!(kernel.outbox().is_empty());
        let stored = store.inner.get_reservation(&rid).unwrap().unwrap();
        assert_eq!(stored.sequence_out, 1);
    }

    #[test]
    fn recover_reloads_and_resumes() {
        let store: Arc<dyn ActorStore> = Arc::new(MemoryStore::new());
        let rid = {
            let (mut first, _rx) = kernel(
                "ctl",
                ActorRole::Controller,
                Box::new(SimpleClientPolicy::new()),
                store.clone(),
            );
            let rid = client_reservation(&mut first);
            first.ticket(&rid).unwrap();
            first.commit().unwrap();
            rid
        };

        let (mut second, _rx) = kernel(
            "ctl",
            ActorRole::Controller,
            Box::new(SimpleClientPolicy::new()),
            store,
        );
        second.recover().unwrap();
        let r = second.reservation(&rid).unwrap();
        assert_eq!(r.core().pending(), ReservationPendingState::Ticketing);
        assert!(r.record().pending_recover);
        assert_eq!(r.record().sequence_out, 1);
        assert_eq!(second.slices().count(), 1);
    }

    #[test]
    fn query_reports_counts_and_policy() {
        let (mut kernel, _rx) = client_kernel();
        client_reservation(&mut kernel);
        let out = kernel.query();
        assert_eq!(out["role"], "controller");
        assert_eq!(out["reservations"], "1");
        assert_eq!(out["reservations.Nascent"], "1");
        assert!(out.keys().any(|k| k.starts_with("policy.")));
    }

    #[test]
    fn failure_without_target_is_ignored() {
        let (mut kernel, _rx) = client_kernel();
        let message = RpcMessage::new(
            RpcRequestType::Query,
            kernel.identity().clone(),
            RpcPayload::Query(BTreeMap::new()),
        );
        let failure = RpcFailure::new(
            FailureKind::Timeout,
            &message,
            "no answer",
        );
        kernel.handle_failed_rpc(&failure);
        assert_eq!(kernel.reservations().count(), 0);
    }
}

//! Slices.
//!
//! A [`Slice`] groups reservations and delegations under one owner and
//! carries the [`AccessGuard`] every request into the slice is checked
//! against. Membership is stored as id sets; the objects themselves live
//! in the kernel's indexes.

use leasehold_auth::{AccessGuard, Permission};
use leasehold_types::{ActorId, AuthToken, DelegationId, ReservationId, SliceId, SliceKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Named grouping of reservations and delegations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slice {
    slice_id: SliceId,
    name: String,
    kind: SliceKind,
    guard: AccessGuard,
    #[serde(default)]
    reservations: BTreeSet<ReservationId>,
    #[serde(default)]
    delegations: BTreeSet<DelegationId>,
}

impl Slice {
    /// Creates a slice with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, owner: AuthToken, kind: SliceKind) -> Self {
        Self::with_id(SliceId::new(), name, owner, kind)
    }

    /// Creates a slice with a known id, e.g. one first seen on an inbound request.
    #[must_use]
    pub fn with_id(
        slice_id: SliceId,
        name: impl Into<String>,
        owner: AuthToken,
        kind: SliceKind,
    ) -> Self {
        Self {
            slice_id,
            name: name.into(),
            kind,
            guard: AccessGuard::new(owner),
            reservations: BTreeSet::new(),
            delegations: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn slice_id(&self) -> SliceId {
        self.slice_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> SliceKind {
        self.kind
    }

    #[must_use]
    pub fn owner(&self) -> &AuthToken {
        self.guard.owner()
    }

    #[must_use]
    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Grants a peer permissions on this slice.
    pub fn grant(&mut self, peer: ActorId, permission: Permission) {
        self.guard.grant(peer, permission);
    }

    pub fn reservations(&self) -> impl Iterator<Item = &ReservationId> {
        self.reservations.iter()
    }

    pub fn delegations(&self) -> impl Iterator<Item = &DelegationId> {
        self.delegations.iter()
    }

    #[must_use]
    pub fn contains_reservation(&self, rid: &ReservationId) -> bool {
        self.reservations.contains(rid)
    }

    #[must_use]
    pub fn contains_delegation(&self, did: &DelegationId) -> bool {
        self.delegations.contains(did)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty() && self.delegations.is_empty()
    }

    pub(crate) fn add_reservation(&mut self, rid: ReservationId) -> bool {
        self.reservations.insert(rid)
    }

    pub(crate) fn remove_reservation(&mut self, rid: &ReservationId) -> bool {
        self.reservations.remove(rid)
    }

    pub(crate) fn add_delegation(&mut self, did: DelegationId) -> bool {
        self.delegations.insert(did)
    }

    pub(crate) fn remove_delegation(&mut self, did: &DelegationId) -> bool {
        self.delegations.remove(did)
    }
}

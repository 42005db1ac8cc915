//! Delegation state machine.
//!
//! A delegation hands authority over a pool of resources from an
//! advertiser (usually a site authority) to a holder (usually a broker).
//! The pool itself is an opaque graph string that only policies read.
//!
//! ```text
//!  advertiser                                   holder
//!  advertise ─► [Delegated] (exported)          register (exported)
//!                                               delegate ─► [Delegated]
//!       ◄──────────── ClaimDelegation ──────────────┘
//!  claim: update_pending
//!  probe ─────────── UpdateDelegation(graph) ──────►  donate_delegation
//!  reclaim ─► [Reclaimed]
//!        ─────────── ReclaimDelegation ────────────►  [Reclaimed]
//!       ◄──────────── Relinquish ──────────────────── close ─► [Closed]
//!  [Reclaimed]
//! ```

use crate::context::{OpContext, Outbound};
use crate::error::KernelError;
use leasehold_event::{DelegationWire, RpcFailure, RpcPayload, RpcRequestType, UpdateData};
use leasehold_types::{ActorId, DelegationId, DelegationState, MessageId, SliceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, Span};

/// Which end of a delegation this actor holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegationRole {
    /// Received the pool.
    Holder,
    /// Owns the pool and hands it out.
    Advertiser,
}

impl fmt::Display for DelegationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Holder => "holder",
            Self::Advertiser => "advertiser",
        })
    }
}

/// Persistent delegation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub delegation_id: DelegationId,
    pub name: String,
    pub slice_id: SliceId,
    pub slice_name: String,
    pub role: DelegationRole,
    pub state: DelegationState,
    #[serde(default)]
    pub graph: Option<String>,
    #[serde(default)]
    pub sequence_in: u64,
    #[serde(default)]
    pub sequence_out: u64,
    /// May be claimed by a peer.
    #[serde(default)]
    pub exported: bool,
    #[serde(default)]
    pub relinquished: bool,
    #[serde(default)]
    pub update_pending: bool,
    #[serde(default)]
    pub notified_failed: bool,
    /// Advertiser on the holder side, claimant on the advertiser side.
    #[serde(default)]
    pub peer: Option<ActorId>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub update: UpdateData,
}

impl DelegationRecord {
    #[must_use]
    pub fn new(
        delegation_id: DelegationId,
        name: impl Into<String>,
        role: DelegationRole,
        slice_id: SliceId,
        slice_name: impl Into<String>,
    ) -> Self {
        Self {
            delegation_id,
            name: name.into(),
            slice_id,
            slice_name: slice_name.into(),
            role,
            state: DelegationState::Nascent,
            graph: None,
            sequence_in: 0,
            sequence_out: 0,
            exported: false,
            relinquished: false,
            update_pending: false,
            notified_failed: false,
            peer: None,
            reply_to: None,
            update: UpdateData::default(),
        }
    }

    #[must_use]
    pub fn is_removable(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Runtime wrapper around a [`DelegationRecord`].
#[derive(Debug)]
pub struct Delegation {
    record: DelegationRecord,
    dirty: bool,
    span: Span,
}

impl Delegation {
    #[must_use]
    pub fn restore(record: DelegationRecord) -> Self {
        let span = tracing::debug_span!(
            "delegation",
            did = %record.delegation_id,
            role = %record.role
        );
        Self {
            record,
            dirty: false,
            span,
        }
    }

    #[must_use]
    pub fn record(&self) -> &DelegationRecord {
        &self.record
    }

    pub(crate) fn record_mut(&mut self) -> &mut DelegationRecord {
        &mut self.record
    }

    #[must_use]
    pub fn to_record(&self) -> DelegationRecord {
        self.record.clone()
    }

    #[must_use]
    pub fn delegation_id(&self) -> DelegationId {
        self.record.delegation_id
    }

    #[must_use]
    pub fn slice_id(&self) -> SliceId {
        self.record.slice_id
    }

    #[must_use]
    pub fn state(&self) -> DelegationState {
        self.record.state
    }

    #[must_use]
    pub fn role(&self) -> DelegationRole {
        self.record.role
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn transition(&mut self, prefix: &str, state: DelegationState) {
        let _enter = self.span.enter();
        debug!("{}: [{}] -> [{}]", prefix, self.record.state, state);
        self.record.state = state;
        self.dirty = true;
    }

    /// Fails without notifying the peer.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.fail_with(message.into(), true);
    }

    /// Fails and owes the peer one failure update.
    pub fn fail_notify(&mut self, message: impl Into<String>) {
        self.fail_with(message.into(), false);
    }

    fn fail_with(&mut self, message: String, notified: bool) {
        {
            let _enter = self.span.enter();
            error!("delegation failed: {}", message);
        }
        self.record.update.error(message);
        self.record.notified_failed = notified;
        self.transition("fail", DelegationState::Failed);
    }

    #[must_use]
    pub fn wire(&self) -> DelegationWire {
        DelegationWire {
            delegation_id: self.record.delegation_id,
            name: self.record.name.clone(),
            slice_id: self.record.slice_id,
            slice_name: self.record.slice_name.clone(),
            graph: self.record.graph.clone(),
            update: self.record.update.clone(),
        }
    }

    fn peer(&self) -> Result<ActorId, KernelError> {
        self.record.peer.ok_or_else(|| {
            KernelError::invalid_state(format!("{} has no peer", self.record.delegation_id))
        })
    }

    fn send(&mut self, kind: RpcRequestType, wire: DelegationWire, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let to = self.peer()?;
        self.record.sequence_out += 1;
        let reply_to = self.record.reply_to.take();
        ctx.send(
            Outbound::new(
                kind,
                to,
                self.record.sequence_out,
                RpcPayload::Delegation(wire),
            )
            .in_reply_to(reply_to),
        );
        self.dirty = true;
        Ok(())
    }

    /// Holder side: claims an exported delegation from its advertiser.
    pub fn delegate(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let state = self.record.state;
        if !matches!(state, DelegationState::Nascent | DelegationState::Reclaimed) {
            return Err(KernelError::invalid_state(format!(
                "delegate not allowed in [{state}]"
            )));
        }
        if !self.record.exported {
            return Err(KernelError::invalid_state(format!(
                "{} is not exported",
                self.record.delegation_id
            )));
        }
        let wire = self.wire();
        self.send(RpcRequestType::ClaimDelegation, wire, ctx)?;
        self.transition("delegate", DelegationState::Delegated);
        Ok(())
    }

    /// Advertiser side: asks the policy whether the pool may be handed out.
    pub fn map_and_update(&mut self, delegated: bool, ctx: &mut OpContext<'_>) {
        if delegated || self.record.state != DelegationState::Nascent {
            debug!(did = %self.record.delegation_id, "map_and_update: nothing to bind");
            return;
        }
        let decision = match ctx.policy.as_authority_mut() {
            Some(authority) => authority.bind_delegation(&self.record),
            None => {
                self.fail_notify("policy cannot advertise delegations");
                return;
            }
        };
        match decision {
            Ok(true) => {
                self.record.exported = true;
                self.transition("advertise", DelegationState::Delegated);
            }
            Ok(false) => {
                debug!(did = %self.record.delegation_id, "advertise deferred");
            }
            Err(e) => self.fail_notify(format!("policy bind_delegation failed: {e}")),
        }
    }

    /// Advertiser side: a holder asked for the pool.
    pub fn claim(&mut self, callback: ActorId, request: MessageId) {
        match self.record.state {
            DelegationState::Delegated => {}
            DelegationState::Reclaimed => self.transition("claim", DelegationState::Delegated),
            state => {
                self.record.peer = Some(callback);
                self.fail_notify(format!("claim not allowed in [{state}]"));
                return;
            }
        }
        self.record.peer = Some(callback);
        self.record.reply_to = Some(request);
        self.record.update_pending = true;
        self.dirty = true;
    }

    /// Advertiser side: takes the pool back from the holder.
    pub fn reclaim(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        if self.record.state != DelegationState::Delegated {
            return Err(KernelError::invalid_state(format!(
                "reclaim not allowed in [{}]",
                self.record.state
            )));
        }
        ctx.policy.update_delegation_complete(&self.record);
        self.transition("reclaim", DelegationState::Reclaimed);
        self.record.update_pending = false;
        if self.record.peer.is_some() {
            self.service_reclaim(ctx)?;
        }
        Ok(())
    }

    fn service_reclaim(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        let mut wire = self.wire();
        wire.graph = None;
        self.send(RpcRequestType::ReclaimDelegation, wire, ctx)
    }

    /// Holder side: closes the delegation and hands the pool back, once.
    pub fn close(&mut self, ctx: &mut OpContext<'_>) -> Result<(), KernelError> {
        if self.record.state == DelegationState::Closed {
            debug!(did = %self.record.delegation_id, "close: already closed");
            return Ok(());
        }
        self.transition("close", DelegationState::Closed);
        if !self.record.relinquished {
            self.record.relinquished = true;
            ctx.policy.closed_delegation(&self.record);
            if self.record.peer.is_some() {
                let wire = self.wire();
                self.send(RpcRequestType::Relinquish, wire, ctx)?;
            }
        }
        Ok(())
    }

    /// Advertiser side: the holder gave the pool back.
    pub fn relinquish_received(&mut self, ctx: &mut OpContext<'_>) {
        match self.record.state {
            DelegationState::Delegated => {
                ctx.policy.update_delegation_complete(&self.record);
                self.record.update_pending = false;
                self.transition("relinquished", DelegationState::Reclaimed);
            }
            state => debug!(did = %self.record.delegation_id, "relinquish in [{}]; ignored", state),
        }
    }

    /// Holder side: the advertiser sent the pool or took it back.
    pub fn update_delegation(&mut self, wire: &DelegationWire, ctx: &mut OpContext<'_>) {
        self.record.update.absorb(&wire.update);
        self.dirty = true;

        if wire.update.is_failed() {
            let reason = wire.update.message().unwrap_or("no reason given");
            self.fail(format!("advertiser failed the delegation: {reason}"));
            return;
        }

        match self.record.state {
            DelegationState::Nascent | DelegationState::Delegated | DelegationState::Reclaimed => {
                match &wire.graph {
                    Some(graph) => {
                        self.record.graph = Some(graph.clone());
                        self.transition("update delegation", DelegationState::Delegated);
                        if let Err(e) = ctx.policy.donate_delegation(&self.record) {
                            self.fail(format!("donate failed: {e}"));
                            return;
                        }
                    }
                    None => {
                        self.record.graph = None;
                        self.transition("update delegation", DelegationState::Reclaimed);
                    }
                }
                ctx.policy.update_delegation_complete(&self.record);
            }
            DelegationState::Failed => {
                debug!(did = %self.record.delegation_id, "update for failed delegation; ignored");
            }
            DelegationState::Closed => {
                debug!(did = %self.record.delegation_id, "update for closed delegation; ignored");
            }
        }
    }

    #[must_use]
    pub fn needs_probe(&self) -> bool {
        self.record.update_pending
            || (self.record.state == DelegationState::Failed && !self.record.notified_failed)
    }

    /// Sends what the last transition left owed to the peer.
    pub fn probe_pending(&mut self, ctx: &mut OpContext<'_>) {
        if self.record.state == DelegationState::Failed {
            if !self.record.notified_failed {
                self.record.notified_failed = true;
                self.dirty = true;
                if self.record.peer.is_some() {
                    let wire = self.wire();
                    if let Err(e) = self.send(RpcRequestType::UpdateDelegation, wire, ctx) {
                        debug!(did = %self.record.delegation_id, "failure not sent: {}", e);
                    }
                }
            }
            return;
        }
        if self.record.update_pending {
            self.record.update_pending = false;
            self.dirty = true;
            let wire = self.wire();
            if let Err(e) = self.send(RpcRequestType::UpdateDelegation, wire, ctx) {
                self.fail(format!("update failed: {e}"));
            }
        }
    }

    pub fn handle_failed_rpc(&mut self, failure: &RpcFailure) {
        match failure.request_type {
            RpcRequestType::ClaimDelegation if self.record.state == DelegationState::Delegated => {
                if self.record.graph.is_none() {
                    self.fail(format!("claim failed ({}): {}", failure.kind, failure.message));
                }
            }
            other => {
                self.record
                    .update
                    .post_event(format!("{other} not delivered: {}", failure.message));
                self.dirty = true;
            }
        }
    }

    /// Holder side: re-claims a delegation whose graph never arrived.
    pub fn recover(&mut self, ctx: &mut OpContext<'_>) {
        if self.record.role == DelegationRole::Holder
            && self.record.state == DelegationState::Delegated
            && self.record.graph.is_none()
        {
            let to = match self.peer() {
                Ok(to) => to,
                Err(e) => {
                    self.fail(e.to_string());
                    return;
                }
            };
            ctx.send(Outbound::new(
                RpcRequestType::ClaimDelegation,
                to,
                self.record.sequence_out,
                RpcPayload::Delegation(self.wire()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AuthorityPolicy, Policy, PolicyError};
    use crate::reservation::ReservationCore;
    use crate::testing::Harness;

    #[derive(Default)]
    struct Recorder {
        donated: Vec<String>,
        closed: usize,
        completed: usize,
        refuse: bool,
    }

    impl Policy for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn closed_delegation(&mut self, _d: &DelegationRecord) {
            self.closed += 1;
        }

        fn donate_delegation(&mut self, d: &DelegationRecord) -> Result<(), PolicyError> {
            self.donated.extend(d.graph.clone());
            Ok(())
        }

        fn update_delegation_complete(&mut self, _d: &DelegationRecord) {
            self.completed += 1;
        }

        fn as_authority_mut(&mut self) -> Option<&mut dyn AuthorityPolicy> {
            Some(self)
        }
    }

    impl AuthorityPolicy for Recorder {
        fn bind(&mut self, _r: &mut ReservationCore, _c: u64) -> Result<bool, PolicyError> {
            Ok(false)
        }

        fn extend_authority(&mut self, _r: &mut ReservationCore, _c: u64) -> Result<bool, PolicyError> {
            Ok(false)
        }

        fn bind_delegation(&mut self, _d: &DelegationRecord) -> Result<bool, PolicyError> {
            if self.refuse {
                Err(PolicyError::InvalidGraph("empty".into()))
            } else {
                Ok(true)
            }
        }
    }

    fn delegation(role: DelegationRole) -> Delegation {
        let mut record =
            DelegationRecord::new(DelegationId::new(), "pool", role, SliceId::new(), "inventory");
        record.graph = Some(r#"{"vm":10}"#.to_string());
        Delegation::restore(record)
    }

    fn holder() -> Delegation {
        let mut d = delegation(DelegationRole::Holder);
        d.record_mut().graph = None;
        d.record_mut().exported = true;
        d.record_mut().peer = Some(ActorId::named("site"));
        d
    }

    #[test]
    fn claim_then_close_relinquishes_once() {
        let mut h = Harness::new("broker", Recorder::default());
        let mut d = holder();

        d.delegate(&mut h.ctx()).unwrap();
        assert_eq!(d.state(), DelegationState::Delegated);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, RpcRequestType::ClaimDelegation);

        d.close(&mut h.ctx()).unwrap();
        d.close(&mut h.ctx()).unwrap();
        assert_eq!(d.state(), DelegationState::Closed);
        assert_eq!(h.policy.closed, 1);
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, RpcRequestType::Relinquish);
    }

    #[test]
    fn delegate_requires_export() {
        let mut h = Harness::new("broker", Recorder::default());
        let mut d = holder();
        d.record_mut().exported = false;
        assert!(matches!(
            d.delegate(&mut h.ctx()),
            Err(KernelError::InvalidState(_))
        ));
        assert_eq!(d.state(), DelegationState::Nascent);
    }

    #[test]
    fn advertise_claim_update_reclaim() {
        let mut h = Harness::new("site", Recorder::default());
        let mut d = delegation(DelegationRole::Advertiser);

        d.map_and_update(false, &mut h.ctx());
        assert_eq!(d.state(), DelegationState::Delegated);
        assert!(d.record().exported);

        let request = MessageId::new();
        d.claim(ActorId::named("broker"), request);
        assert!(d.needs_probe());
        d.probe_pending(&mut h.ctx());
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, RpcRequestType::UpdateDelegation);
        assert_eq!(sent[0].reply_to, Some(request));
        assert!(!d.needs_probe());

        d.reclaim(&mut h.ctx()).unwrap();
        assert_eq!(d.state(), DelegationState::Reclaimed);
        assert_eq!(h.policy.completed, 1);
        let sent = h.sent();
        assert_eq!(sent[0].kind, RpcRequestType::ReclaimDelegation);
        match &sent[0].payload {
            RpcPayload::Delegation(wire) => assert!(wire.graph.is_none()),
            other => panic!("unexpected payload {other:?}"),
        }

        d.claim(ActorId::named("broker"), MessageId::new());
        assert_eq!(d.state(), DelegationState::Delegated);
    }

    #[test]
    fn refused_advertise_fails() {
        let mut h = Harness::new(
            "site",
            Recorder {
                refuse: true,
                ..Default::default()
            },
        );
        let mut d = delegation(DelegationRole::Advertiser);
        d.map_and_update(false, &mut h.ctx());
        assert_eq!(d.state(), DelegationState::Failed);
    }

    #[test]
    fn claim_on_nascent_fails_and_notifies_once() {
        let mut h = Harness::new("site", Recorder::default());
        let mut d = delegation(DelegationRole::Advertiser);
        d.claim(ActorId::named("broker"), MessageId::new());
        assert_eq!(d.state(), DelegationState::Failed);

        d.probe_pending(&mut h.ctx());
        d.probe_pending(&mut h.ctx());
        assert_eq!(h.sent().len(), 1);
    }

    #[test]
    fn holder_absorbs_graph_then_reclaim() {
        let mut h = Harness::new("broker", Recorder::default());
        let mut d = holder();
        d.delegate(&mut h.ctx()).unwrap();

        let mut wire = d.wire();
        wire.graph = Some(r#"{"vm":10}"#.to_string());
        d.update_delegation(&wire, &mut h.ctx());
        assert_eq!(d.state(), DelegationState::Delegated);
        assert_eq!(h.policy.donated.len(), 1);

        wire.graph = None;
        d.update_delegation(&wire, &mut h.ctx());
        assert_eq!(d.state(), DelegationState::Reclaimed);
        assert!(d.record().graph.is_none());
    }

    #[test]
    fn failed_update_fails_holder() {
        let mut h = Harness::new("broker", Recorder::default());
        let mut d = holder();
        let mut wire = d.wire();
        wire.update.error("pool withdrawn");
        d.update_delegation(&wire, &mut h.ctx());
        assert_eq!(d.state(), DelegationState::Failed);
        assert!(!d.needs_probe());
    }

    #[test]
    fn recover_reclaims_missing_graph() {
        let mut h = Harness::new("broker", Recorder::default());
        let mut d = holder();
        d.delegate(&mut h.ctx()).unwrap();
        h.sent();

        d.recover(&mut h.ctx());
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sequence, 1);
    }
}

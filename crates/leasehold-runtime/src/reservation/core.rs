//! State shared by every reservation role.

use super::record::{ReservationRecord, ReservationRole};
use leasehold_event::ReservationWire;
use leasehold_types::{
    ReservationId, ReservationPendingState, ReservationState, ResourceSet, SliceId, Term,
};
use tracing::{debug, error, warn, Span};

/// Runtime wrapper around a [`ReservationRecord`].
///
/// Holds what must not be persisted: the dirty flag, the action chosen by
/// the last probe and a tracing span.
#[derive(Debug)]
pub struct ReservationCore {
    record: ReservationRecord,
    dirty: bool,
    service_pending: ReservationPendingState,
    span: Span,
}

impl ReservationCore {
    #[must_use]
    pub fn new(record: ReservationRecord) -> Self {
        let span = tracing::debug_span!(
            "reservation",
            rid = %record.reservation_id,
            role = %record.role
        );
        Self {
            record,
            dirty: false,
            service_pending: ReservationPendingState::None,
            span,
        }
    }

    #[must_use]
    pub fn record(&self) -> &ReservationRecord {
        &self.record
    }

    /// Direct access for the state machines. Callers mark dirty themselves.
    pub(crate) fn record_mut(&mut self) -> &mut ReservationRecord {
        &mut self.record
    }

    #[must_use]
    pub fn reservation_id(&self) -> ReservationId {
        self.record.reservation_id
    }

    #[must_use]
    pub fn slice_id(&self) -> SliceId {
        self.record.slice_id
    }

    #[must_use]
    pub fn role(&self) -> ReservationRole {
        self.record.role
    }

    #[must_use]
    pub fn state(&self) -> ReservationState {
        self.record.state
    }

    #[must_use]
    pub fn pending(&self) -> ReservationPendingState {
        self.record.pending
    }

    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
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

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.record.state == ReservationState::Failed
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.record.state == ReservationState::Closed
    }

    /// Moves both state axes at once. `Closed` and `Failed` always pair
    /// with no pending operation.
    pub fn transition(
        &mut self,
        prefix: &str,
        state: ReservationState,
        pending: ReservationPendingState,
    ) {
        let pending = if state.is_terminal() {
            ReservationPendingState::None
        } else {
            pending
        };
        let _enter = self.span.enter();
        debug!(
            "{}: [{}, {}] -> [{}, {}]",
            prefix, self.record.state, self.record.pending, state, pending
        );
        self.record.state = state;
        self.record.pending = pending;
        self.dirty = true;
    }

    /// Fails without notifying the peer.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.fail_with(message.into(), true);
    }

    /// Fails and owes the peer one failure update, sent by the next probe.
    pub fn fail_notify(&mut self, message: impl Into<String>) {
        self.fail_with(message.into(), false);
    }

    /// A closed reservation stays closed.
    fn fail_with(&mut self, message: String, notified: bool) {
        {
            let _enter = self.span.enter();
            if self.record.state == ReservationState::Closed {
                warn!("ignoring failure on closed reservation: {}", message);
                return;
            }
            error!("reservation failed: {}", message);
        }
        self.record.update.error(message);
        self.record.notified_failed = notified;
        self.transition(
            "fail",
            ReservationState::Failed,
            ReservationPendingState::None,
        );
    }

    #[must_use]
    pub fn requested_term(&self) -> Option<&Term> {
        self.record.requested_term.as_ref()
    }

    #[must_use]
    pub fn requested_resources(&self) -> &ResourceSet {
        &self.record.requested_resources
    }

    #[must_use]
    pub fn approved_term(&self) -> Option<&Term> {
        self.record.approved_term.as_ref()
    }

    #[must_use]
    pub fn approved_resources(&self) -> Option<&ResourceSet> {
        self.record.approved_resources.as_ref()
    }

    #[must_use]
    pub fn term(&self) -> Option<&Term> {
        self.record.term.as_ref()
    }

    #[must_use]
    pub fn resources(&self) -> Option<&ResourceSet> {
        self.record.resources.as_ref()
    }

    /// Records a policy decision. Takes effect on the next `map_and_update`.
    pub fn approve(&mut self, term: Term, resources: ResourceSet) {
        self.record.approved_term = Some(term);
        self.record.approved_resources = Some(resources);
        self.dirty = true;
    }

    #[must_use]
    pub fn has_approval(&self) -> bool {
        self.record.approved_term.is_some() && self.record.approved_resources.is_some()
    }

    /// Resources a policy should free on close.
    ///
    /// After a close during priming the current resources may be half
    /// applied, so the previous (or else the approved) set is returned.
    #[must_use]
    pub fn resources_for_release(&self) -> Option<&ResourceSet> {
        if self.record.closed_in_priming {
            self.record
                .previous_resources
                .as_ref()
                .or(self.record.approved_resources.as_ref())
        } else {
            self.record.resources.as_ref()
        }
    }

    /// Copies the approval into the current term and resources.
    ///
    /// With `extending`, the current values are kept as previous and the
    /// approved term must extend the current one.
    pub(crate) fn install_approval(&mut self, extending: bool) -> Result<(), String> {
        let (Some(term), Some(resources)) = (
            self.record.approved_term,
            self.record.approved_resources.clone(),
        ) else {
            return Err("no approved term and resources".to_string());
        };

        if extending {
            if let Some(current) = &self.record.term {
                term.ensure_extends(current).map_err(|e| e.to_string())?;
            }
            self.record.previous_term = self.record.term.take();
            self.record.previous_resources = self.record.resources.take();
        }

        self.record.term = Some(term);
        self.record.resources = Some(resources);
        self.dirty = true;
        Ok(())
    }

    pub(crate) fn set_service_pending(&mut self, action: ReservationPendingState) {
        self.service_pending = action;
    }

    pub(crate) fn take_service_pending(&mut self) -> ReservationPendingState {
        std::mem::take(&mut self.service_pending)
    }

    #[must_use]
    pub fn service_pending(&self) -> ReservationPendingState {
        self.service_pending
    }

    /// Payload of a client request: what is being asked for.
    #[must_use]
    pub fn request_wire(&self) -> ReservationWire {
        ReservationWire {
            reservation_id: self.record.reservation_id,
            slice_id: self.record.slice_id,
            slice_name: self.record.slice_name.clone(),
            term: self.record.requested_term,
            resources: self.record.requested_resources.clone(),
            renewable: self.record.renewable,
            closed: false,
            update: self.record.update.clone(),
        }
    }

    /// Payload of a client request that presents what it holds (redeem,
    /// lease extension, close).
    #[must_use]
    pub fn holding_wire(&self) -> ReservationWire {
        let mut wire = self.update_wire();
        wire.closed = false;
        wire
    }

    /// Payload of a server update: what was granted.
    #[must_use]
    pub fn update_wire(&self) -> ReservationWire {
        ReservationWire {
            reservation_id: self.record.reservation_id,
            slice_id: self.record.slice_id,
            slice_name: self.record.slice_name.clone(),
            term: self.record.term.or(self.record.requested_term),
            resources: self
                .record
                .resources
                .clone()
                .unwrap_or_else(|| self.record.requested_resources.clone()),
            renewable: self.record.renewable,
            closed: self.record.state == ReservationState::Closed,
            update: self.record.update.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn core() -> ReservationCore {
        ReservationCore::new(ReservationRecord::new(
            ReservationRole::Broker,
            SliceId::new(),
            "demo",
            ResourceSet::new(4, "vm"),
            Some(Term::starting_at(Utc::now(), Duration::hours(1)).unwrap()),
        ))
    }

    #[test]
    fn transition_marks_dirty() {
        let mut core = core();
        assert!(!core.is_dirty());
        core.transition(
            "test",
            ReservationState::Nascent,
            ReservationPendingState::Ticketing,
        );
        assert!(core.is_dirty());
        assert_eq!(core.pending(), ReservationPendingState::Ticketing);
    }

    #[test]
    fn closed_always_pairs_with_none() {
        let mut core = core();
        core.transition(
            "test",
            ReservationState::Closed,
            ReservationPendingState::Priming,
        );
        assert_eq!(core.state(), ReservationState::Closed);
        assert!(core.pending().is_none());
    }

    #[test]
    fn fail_records_message_and_notification() {
        let mut core = core();
        core.fail_notify("out of units");
        assert!(core.is_failed());
        assert!(!core.record().notified_failed);
        assert!(core.record().update.is_failed());

        let mut silent = self::core();
        silent.fail("peer failed");
        assert!(silent.record().notified_failed);
    }

    #[test]
    fn closed_reservation_cannot_fail() {
        let mut core = core();
        core.transition(
            "close",
            ReservationState::Closed,
            ReservationPendingState::None,
        );
        core.fail_notify("late failure");
        assert_eq!(core.state(), ReservationState::Closed);
        assert!(!core.record().update.is_failed());
    }

    #[test]
    fn install_requires_approval() {
        let mut core = core();
        assert!(core.install_approval(false).is_err());

        let term = *core.requested_term().unwrap();
        core.approve(term, ResourceSet::new(4, "vm"));
        core.install_approval(false).unwrap();
        assert_eq!(core.resources().map(|r| r.units), Some(4));
        assert!(core.record().previous_resources.is_none());
    }

    #[test]
    fn extension_snapshots_previous_and_checks_term() {
        let mut core = core();
        let term = *core.requested_term().unwrap();
        core.approve(term, ResourceSet::new(4, "vm"));
        core.install_approval(false).unwrap();

        core.approve(term, ResourceSet::new(6, "vm"));
        assert!(core.install_approval(true).is_err());

        core.approve(term.extend(Duration::hours(1)), ResourceSet::new(6, "vm"));
        core.install_approval(true).unwrap();
        assert_eq!(core.record().previous_resources.as_ref().map(|r| r.units), Some(4));
        assert_eq!(core.resources().map(|r| r.units), Some(6));
    }

    #[test]
    fn release_after_priming_close_uses_previous_or_approved() {
        let mut core = core();
        let term = *core.requested_term().unwrap();
        core.approve(term, ResourceSet::new(4, "vm"));
        core.install_approval(false).unwrap();
        core.record_mut().resources = Some(ResourceSet::new(99, "vm"));

        core.record_mut().closed_in_priming = true;
        assert_eq!(core.resources_for_release().map(|r| r.units), Some(4));

        core.record_mut().previous_resources = Some(ResourceSet::new(2, "vm"));
        assert_eq!(core.resources_for_release().map(|r| r.units), Some(2));
    }

    #[test]
    fn update_wire_reports_closed() {
        let mut core = core();
        assert!(!core.update_wire().closed);
        core.transition("close", ReservationState::Closed, ReservationPendingState::None);
        assert!(core.update_wire().closed);
    }
}

//! Authority-side reservation: turns tickets into leases.

use super::core::ReservationCore;
use super::server::ServerReservation;
use crate::context::OpContext;
use crate::policy::PolicyError;
use leasehold_event::RpcRequestType;
use leasehold_types::{ReservationPendingState, ReservationState};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct AuthorityReservation {
    core: ReservationCore,
}

impl AuthorityReservation {
    #[must_use]
    pub fn new(core: ReservationCore) -> Self {
        Self { core }
    }

    /// Applies configuration changes to an active lease. The holder is
    /// updated by the next probe.
    pub fn modify_lease(&mut self, config: &BTreeMap<String, String>) {
        let core = &mut self.core;
        if core.state() != ReservationState::Active || !core.pending().is_none() {
            let message = format!(
                "modify lease: unexpected state [{}, {}]",
                core.state(),
                core.pending()
            );
            core.fail_notify(message);
            return;
        }
        if let Some(resources) = core.record_mut().resources.as_mut() {
            resources
                .data
                .config
                .extend(config.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        core.transition(
            "modify lease",
            ReservationState::Active,
            ReservationPendingState::Priming,
        );
    }
}

impl ServerReservation for AuthorityReservation {
    const ISSUED: ReservationState = ReservationState::Active;
    const CREATING: ReservationPendingState = ReservationPendingState::Redeeming;
    const EXTENDING: ReservationPendingState = ReservationPendingState::ExtendingLease;
    const UPDATE_KIND: RpcRequestType = RpcRequestType::UpdateLease;

    fn core(&self) -> &ReservationCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ReservationCore {
        &mut self.core
    }

    fn policy_bind(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError> {
        let cycle = ctx.cycle;
        ctx.policy
            .as_authority_mut()
            .ok_or(PolicyError::MissingCapability("authority"))?
            .bind(&mut self.core, cycle)
    }

    fn policy_extend(&mut self, ctx: &mut OpContext<'_>) -> Result<bool, PolicyError> {
        let cycle = ctx.cycle;
        ctx.policy
            .as_authority_mut()
            .ok_or(PolicyError::MissingCapability("authority"))?
            .extend_authority(&mut self.core, cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::DelegationRecord;
    use crate::policy::{AuthorityPolicy, Policy};
    use crate::reservation::{ReservationRecord, ReservationRole};
    use crate::testing::{hour_term, Harness};
    use leasehold_event::RpcPayload;
    use leasehold_types::{ActorId, ConcreteSet, ResourceSet, SliceId};

    struct Leaser;

    impl Policy for Leaser {
        fn name(&self) -> &'static str {
            "leaser"
        }

        fn as_authority_mut(&mut self) -> Option<&mut dyn AuthorityPolicy> {
            Some(self)
        }
    }

    impl AuthorityPolicy for Leaser {
        fn bind(&mut self, r: &mut ReservationCore, _cycle: u64) -> Result<bool, PolicyError> {
            let units = r.requested_resources().units;
            let assigned = (0..units).map(|i| format!("vm-{i}")).collect();
            let resources =
                ResourceSet::new(units, "vm").with_concrete(ConcreteSet::Units { assigned });
            let term = *r.requested_term().unwrap();
            r.approve(term, resources);
            Ok(true)
        }

        fn extend_authority(
            &mut self,
            _r: &mut ReservationCore,
            _cycle: u64,
        ) -> Result<bool, PolicyError> {
            Ok(false)
        }

        fn bind_delegation(&mut self, _d: &DelegationRecord) -> Result<bool, PolicyError> {
            Ok(true)
        }
    }

    struct NotAnAuthority;

    impl Policy for NotAnAuthority {
        fn name(&self) -> &'static str {
            "plain"
        }
    }

    fn reservation() -> AuthorityReservation {
        let mut record = ReservationRecord::new(
            ReservationRole::Authority,
            SliceId::new(),
            "demo",
            ResourceSet::new(2, "vm"),
            Some(hour_term()),
        );
        record.callback = Some(ActorId::named("ctl"));
        AuthorityReservation::new(ReservationCore::new(record))
    }

    #[test]
    fn redeem_produces_active_lease() {
        let mut h = Harness::new("site", Leaser);
        let mut r = reservation();
        r.reserve(&mut h.ctx());
        assert_eq!(r.core().state(), ReservationState::Active);
        assert_eq!(r.core().pending(), ReservationPendingState::Priming);

        r.probe_pending(&mut h.ctx());
        r.service_probe(&mut h.ctx());
        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, RpcRequestType::UpdateLease);
        match &sent[0].payload {
            RpcPayload::Reservation(wire) => {
                assert!(matches!(
                    wire.resources.concrete,
                    Some(ConcreteSet::Units { ref assigned }) if assigned.len() == 2
                ));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn modify_lease_merges_config_and_primes() {
        let mut h = Harness::new("site", Leaser);
        let mut r = reservation();
        r.reserve(&mut h.ctx());
        r.probe_pending(&mut h.ctx());
        r.service_probe(&mut h.ctx());
        h.sent();

        let mut config = BTreeMap::new();
        config.insert("image".to_string(), "debian".to_string());
        r.modify_lease(&config);
        assert_eq!(r.core().pending(), ReservationPendingState::Priming);
        assert_eq!(
            r.core()
                .resources()
                .and_then(|r| r.data.config.get("image"))
                .map(String::as_str),
            Some("debian")
        );

        r.probe_pending(&mut h.ctx());
        r.service_probe(&mut h.ctx());
        assert_eq!(h.sent().len(), 1);
    }

    #[test]
    fn modify_before_active_fails() {
        let mut r = reservation();
        r.modify_lease(&BTreeMap::new());
        assert!(r.core().is_failed());
    }

    #[test]
    fn missing_capability_fails_reservation() {
        let mut h = Harness::new("site", NotAnAuthority);
        let mut r = reservation();
        r.reserve(&mut h.ctx());
        assert!(r.core().is_failed());
        assert!(r
            .core()
            .record()
            .update
            .message()
            .unwrap()
            .contains("authority"));
    }
}

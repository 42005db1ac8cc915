//! Reference broker policy.
//!
//! Keeps one unit counter per resource type. Inventory comes from
//! configuration and from delegations donated by authorities. Requests
//! that do not fit right now are deferred and retried by `allocate`; with
//! manual approval every request waits for an operator verdict first.

use super::{
    parse_unit_graph, AllocationDecision, BrokerPolicy, Policy, PolicyError,
};
use crate::actor::ActorClock;
use crate::config::PolicyConfig;
use crate::delegation::DelegationRecord;
use crate::reservation::{ReservationCore, ReservationRecord, AUTHORITY_KEY};
use chrono::{DateTime, Utc};
use leasehold_types::{
    ActorId, ConcreteSet, DelegationId, DelegationState, ReservationId, ResourceSet, ResourceType,
    Term,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// A request waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingApproval {
    pub reservation_id: ReservationId,
    pub rtype: ResourceType,
    pub units: u32,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalVerdict {
    Approved,
    Rejected(String),
}

#[derive(Debug, Default)]
struct ApprovalState {
    pending: Vec<PendingApproval>,
    verdicts: HashMap<ReservationId, ApprovalVerdict>,
}

/// Operator approval list, shared between the broker's tick and whoever
/// manages it.
#[derive(Debug, Clone, Default)]
pub struct ApprovalQueue {
    inner: Arc<Mutex<ApprovalState>>,
}

impl ApprovalQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit(&self, request: PendingApproval) {
        let mut state = self.inner.lock();
        if !state
            .pending
            .iter()
            .any(|p| p.reservation_id == request.reservation_id)
        {
            state.pending.push(request);
        }
    }

    #[must_use]
    pub fn pending(&self) -> Vec<PendingApproval> {
        self.inner.lock().pending.clone()
    }

    /// Returns `false` if nothing was waiting under that id.
    pub fn approve(&self, rid: &ReservationId) -> bool {
        self.decide(rid, ApprovalVerdict::Approved)
    }

    pub fn reject(&self, rid: &ReservationId, reason: impl Into<String>) -> bool {
        self.decide(rid, ApprovalVerdict::Rejected(reason.into()))
    }

    fn decide(&self, rid: &ReservationId, verdict: ApprovalVerdict) -> bool {
        let mut state = self.inner.lock();
        let before = state.pending.len();
        state.pending.retain(|p| &p.reservation_id != rid);
        if state.pending.len() == before {
            return false;
        }
        state.verdicts.insert(*rid, verdict);
        true
    }

    pub fn take_verdict(&self, rid: &ReservationId) -> Option<ApprovalVerdict> {
        self.inner.lock().verdicts.remove(rid)
    }

    fn withdraw(&self, rid: &ReservationId) {
        let mut state = self.inner.lock();
        state.pending.retain(|p| &p.reservation_id != rid);
        state.verdicts.remove(rid);
    }
}

#[derive(Debug, Default)]
struct Pool {
    total: u32,
    allocated: u32,
    authority: Option<ActorId>,
    delegation: Option<DelegationId>,
}

impl Pool {
    fn free(&self) -> u32 {
        self.total.saturating_sub(self.allocated)
    }
}

#[derive(Debug, Clone)]
struct Allocation {
    rtype: ResourceType,
    units: u32,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Deferred {
    reservation_id: ReservationId,
    rtype: ResourceType,
    units: u32,
    term: Term,
    approved: bool,
}

#[derive(Debug)]
pub struct UnitBrokerPolicy {
    identity: ActorId,
    pools: BTreeMap<ResourceType, Pool>,
    allocations: HashMap<ReservationId, Allocation>,
    deferred: VecDeque<Deferred>,
    donations: HashMap<DelegationId, BTreeMap<ResourceType, u32>>,
    approvals: Option<ApprovalQueue>,
}

impl UnitBrokerPolicy {
    #[must_use]
    pub fn new(identity: ActorId) -> Self {
        Self {
            identity,
            pools: BTreeMap::new(),
            allocations: HashMap::new(),
            deferred: VecDeque::new(),
            donations: HashMap::new(),
            approvals: None,
        }
    }

    /// Builds a policy with the configured inventory, redeemable at
    /// `authority`.
    #[must_use]
    pub fn from_config(identity: ActorId, config: &PolicyConfig, authority: Option<ActorId>) -> Self {
        let mut policy = Self::new(identity);
        for (rtype, units) in &config.inventory {
            policy = policy.with_inventory(rtype.as_str(), *units, authority);
        }
        if config.manual_approval {
            policy = policy.with_manual_approval();
        }
        policy
    }

    #[must_use]
    pub fn with_inventory(
        mut self,
        rtype: impl Into<ResourceType>,
        units: u32,
        authority: Option<ActorId>,
    ) -> Self {
        let pool = self.pools.entry(rtype.into()).or_default();
        pool.total += units;
        pool.authority = pool.authority.or(authority);
        self
    }

    #[must_use]
    pub fn with_manual_approval(mut self) -> Self {
        self.approvals = Some(ApprovalQueue::new());
        self
    }

    /// Free units of a type, zero for unknown types.
    #[must_use]
    pub fn available(&self, rtype: &ResourceType) -> u32 {
        self.pools.get(rtype).map_or(0, Pool::free)
    }

    fn ticket(&self, rtype: &ResourceType, units: u32) -> ResourceSet {
        let pool = self.pools.get(rtype);
        let mut resources = ResourceSet::new(units, rtype.clone()).with_concrete(ConcreteSet::Ticket {
            issuer: self.identity,
            units,
            delegation: pool.and_then(|p| p.delegation),
        });
        if let Some(authority) = pool.and_then(|p| p.authority) {
            resources
                .data
                .resource
                .insert(AUTHORITY_KEY.to_string(), authority.to_string());
        }
        resources
    }

    /// Units currently allocated to `rid` of its type, zero if none.
    fn held(&self, rid: &ReservationId) -> u32 {
        self.allocations.get(rid).map_or(0, |a| a.units)
    }

    /// Checks the request against the pool and decides now or defers.
    fn decide(&mut self, reservation: &mut ReservationCore) -> Result<bool, PolicyError> {
        let rid = reservation.reservation_id();
        let requested = reservation.requested_resources();
        let rtype = requested.rtype.clone();
        let units = requested.units;
        let term = reservation
            .requested_term()
            .copied()
            .ok_or_else(|| PolicyError::invalid_request("no term requested"))?;
        if units == 0 {
            return Err(PolicyError::invalid_request("zero units requested"));
        }

        let (total, free) = self
            .pools
            .get(&rtype)
            .map(|pool| (pool.total, pool.free()))
            .ok_or_else(|| PolicyError::UnknownResourceType(rtype.clone()))?;
        if units > total {
            return Err(PolicyError::insufficient(&rtype, units, total));
        }

        if let Some(approvals) = self.approvals.clone() {
            approvals.submit(PendingApproval {
                reservation_id: rid,
                rtype: rtype.clone(),
                units,
                submitted_at: Utc::now(),
            });
            self.defer(rid, rtype, units, term, false);
            return Ok(false);
        }

        let available = free + self.held(&rid);
        if units > available {
            debug!(rid = %rid, "deferring {} {}: {} available", units, rtype, available);
            self.defer(rid, rtype, units, term, true);
            return Ok(false);
        }

        let (term, resources) = self.grant(rid, &rtype, units, term);
        reservation.approve(term, resources);
        Ok(true)
    }

    fn defer(&mut self, rid: ReservationId, rtype: ResourceType, units: u32, term: Term, approved: bool) {
        self.deferred.retain(|d| d.reservation_id != rid);
        self.deferred.push_back(Deferred {
            reservation_id: rid,
            rtype,
            units,
            term,
            approved,
        });
    }

    /// Books the units, replacing any earlier allocation of the same reservation.
    fn grant(
        &mut self,
        rid: ReservationId,
        rtype: &ResourceType,
        units: u32,
        term: Term,
    ) -> (Term, ResourceSet) {
        self.free_allocation(&rid);
        if let Some(pool) = self.pools.get_mut(rtype) {
            pool.allocated += units;
        }
        self.allocations.insert(
            rid,
            Allocation {
                rtype: rtype.clone(),
                units,
                end: term.end(),
            },
        );
        (term, self.ticket(rtype, units))
    }

    fn free_allocation(&mut self, rid: &ReservationId) {
        if let Some(allocation) = self.allocations.remove(rid) {
            if let Some(pool) = self.pools.get_mut(&allocation.rtype) {
                pool.allocated = pool.allocated.saturating_sub(allocation.units);
            }
        }
    }

    fn forget(&mut self, rid: &ReservationId) {
        self.free_allocation(rid);
        self.deferred.retain(|d| &d.reservation_id != rid);
        if let Some(approvals) = &self.approvals {
            approvals.withdraw(rid);
        }
    }

    fn withdraw_donation(&mut self, did: &DelegationId) {
        let Some(units) = self.donations.remove(did) else {
            return;
        };
        for (rtype, count) in units {
            if let Some(pool) = self.pools.get_mut(&rtype) {
                pool.total = pool.total.saturating_sub(count);
                if pool.delegation == Some(*did) {
                    pool.delegation = None;
                }
            }
        }
        info!(did = %did, "delegated inventory withdrawn");
    }
}

impl Policy for UnitBrokerPolicy {
    fn name(&self) -> &'static str {
        "unit-broker"
    }

    fn close(&mut self, reservation: &ReservationCore) {
        self.forget(&reservation.reservation_id());
    }

    fn release(&mut self, reservation: &ReservationCore) {
        self.forget(&reservation.reservation_id());
    }

    fn donate_delegation(&mut self, delegation: &DelegationRecord) -> Result<(), PolicyError> {
        let graph = delegation
            .graph
            .as_deref()
            .ok_or_else(|| PolicyError::InvalidGraph("no graph".to_string()))?;
        let units = parse_unit_graph(graph)?;
        self.withdraw_donation(&delegation.delegation_id);
        for (rtype, count) in &units {
            let pool = self.pools.entry(rtype.clone()).or_default();
            pool.total += count;
            pool.authority = delegation.peer.or(pool.authority);
            pool.delegation = Some(delegation.delegation_id);
        }
        info!(did = %delegation.delegation_id, "delegated inventory added: {}", graph);
        self.donations.insert(delegation.delegation_id, units);
        Ok(())
    }

    fn update_delegation_complete(&mut self, delegation: &DelegationRecord) {
        if delegation.state != DelegationState::Delegated || delegation.graph.is_none() {
            self.withdraw_donation(&delegation.delegation_id);
        }
    }

    fn closed_delegation(&mut self, delegation: &DelegationRecord) {
        self.withdraw_donation(&delegation.delegation_id);
    }

    fn get_closing(&mut self, cycle: u64, clock: &ActorClock) -> Vec<ReservationId> {
        let now = clock.cycle_start(cycle);
        let mut expired: Vec<ReservationId> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.end < now)
            .map(|(rid, _)| *rid)
            .collect();
        expired.sort();
        expired
    }

    fn revisit(&mut self, reservation: &ReservationRecord) {
        if reservation.state.is_terminal() {
            return;
        }
        if let (Some(resources), Some(term)) = (&reservation.resources, reservation.term) {
            self.grant(
                reservation.reservation_id,
                &resources.rtype,
                resources.units,
                term,
            );
        }
    }

    fn revisit_delegation(&mut self, delegation: &DelegationRecord) {
        if delegation.state == DelegationState::Delegated && delegation.graph.is_some() {
            if let Err(e) = self.donate_delegation(delegation) {
                debug!(did = %delegation.delegation_id, "cannot restore donation: {}", e);
            }
        }
    }

    fn query(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        for (rtype, pool) in &self.pools {
            stats.insert(format!("pool.{rtype}.total"), pool.total.to_string());
            stats.insert(format!("pool.{rtype}.free"), pool.free().to_string());
        }
        stats.insert("deferred".to_string(), self.deferred.len().to_string());
        stats.insert("allocations".to_string(), self.allocations.len().to_string());
        stats
    }

    fn as_broker_mut(&mut self) -> Option<&mut dyn BrokerPolicy> {
        Some(self)
    }
}

impl BrokerPolicy for UnitBrokerPolicy {
    fn bind(&mut self, reservation: &mut ReservationCore, _cycle: u64) -> Result<bool, PolicyError> {
        self.decide(reservation)
    }

    fn extend_broker(
        &mut self,
        reservation: &mut ReservationCore,
        _cycle: u64,
    ) -> Result<bool, PolicyError> {
        if !self.allocations.contains_key(&reservation.reservation_id()) {
            return Err(PolicyError::invalid_request(format!(
                "{} holds no allocation",
                reservation.reservation_id()
            )));
        }
        self.decide(reservation)
    }

    fn allocate(&mut self, _cycle: u64) -> Vec<AllocationDecision> {
        let mut decisions = Vec::new();
        let mut waiting = VecDeque::new();

        while let Some(mut request) = self.deferred.pop_front() {
            if !request.approved {
                match self
                    .approvals
                    .as_ref()
                    .and_then(|a| a.take_verdict(&request.reservation_id))
                {
                    Some(ApprovalVerdict::Approved) => request.approved = true,
                    Some(ApprovalVerdict::Rejected(reason)) => {
                        decisions.push(AllocationDecision::deny(request.reservation_id, reason));
                        continue;
                    }
                    None => {
                        waiting.push_back(request);
                        continue;
                    }
                }
            }

            let available = self.available(&request.rtype) + self.held(&request.reservation_id);
            if request.units <= available {
                let (term, resources) = self.grant(
                    request.reservation_id,
                    &request.rtype,
                    request.units,
                    request.term,
                );
                decisions.push(AllocationDecision::grant(request.reservation_id, term, resources));
            } else {
                waiting.push_back(request);
            }
        }

        self.deferred = waiting;
        decisions
    }

    fn approvals(&self) -> Option<ApprovalQueue> {
        self.approvals.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::AllocationOutcome;
    use crate::reservation::ReservationRole;
    use crate::testing::hour_term;
    use leasehold_types::SliceId;

    fn request(units: u32) -> ReservationCore {
        ReservationCore::new(ReservationRecord::new(
            ReservationRole::Broker,
            SliceId::new(),
            "demo",
            ResourceSet::new(units, "vm"),
            Some(hour_term()),
        ))
    }

    fn broker(units: u32) -> UnitBrokerPolicy {
        UnitBrokerPolicy::new(ActorId::named("broker")).with_inventory(
            "vm",
            units,
            Some(ActorId::named("site")),
        )
    }

    #[test]
    fn grants_ticket_naming_authority() {
        let mut policy = broker(10);
        let mut r = request(10);
        assert!(policy.bind(&mut r, 0).unwrap());

        let approved = r.approved_resources().unwrap();
        assert_eq!(approved.units, 10);
        assert!(matches!(
            approved.concrete,
            Some(ConcreteSet::Ticket { units: 10, .. })
        ));
        assert_eq!(
            approved.data.resource.get(AUTHORITY_KEY),
            Some(&ActorId::named("site").to_string())
        );
        assert_eq!(policy.available(&ResourceType::from("vm")), 0);
    }

    #[test]
    fn more_than_total_is_an_error() {
        let mut policy = broker(4);
        assert!(matches!(
            policy.bind(&mut request(5), 0),
            Err(PolicyError::Insufficient { requested: 5, available: 4, .. })
        ));
    }

    #[test]
    fn unknown_type_is_an_error() {
        let mut policy = UnitBrokerPolicy::new(ActorId::named("broker"));
        assert!(matches!(
            policy.bind(&mut request(1), 0),
            Err(PolicyError::UnknownResourceType(_))
        ));
    }

    #[test]
    fn busy_pool_defers_until_release() {
        let mut policy = broker(4);
        let mut first = request(3);
        let mut second = request(2);
        assert!(policy.bind(&mut first, 0).unwrap());
        assert!(!policy.bind(&mut second, 0).unwrap());
        assert!(policy.allocate(1).is_empty());

        policy.close(&first);
        let decisions = policy.allocate(2);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reservation_id, second.reservation_id());
        assert!(matches!(decisions[0].outcome, AllocationOutcome::Grant { .. }));
    }

    #[test]
    fn manual_approval_waits_for_operator() {
        let mut policy = broker(4).with_manual_approval();
        let queue = policy.approvals().unwrap();
        let mut good = request(1);
        let mut bad = request(1);

        assert!(!policy.bind(&mut good, 0).unwrap());
        assert!(!policy.bind(&mut bad, 0).unwrap());
        assert_eq!(queue.pending().len(), 2);
        assert!(policy.allocate(1).is_empty());

        assert!(queue.approve(&good.reservation_id()));
        assert!(queue.reject(&bad.reservation_id(), "not today"));
        assert!(!queue.approve(&bad.reservation_id()));

        let decisions = policy.allocate(2);
        assert_eq!(decisions.len(), 2);
        assert!(decisions.iter().any(|d| d.reservation_id == good.reservation_id()
            && matches!(d.outcome, AllocationOutcome::Grant { .. })));
        assert!(decisions.iter().any(|d| d.reservation_id == bad.reservation_id()
            && d.outcome == AllocationOutcome::Deny("not today".into())));
    }

    #[test]
    fn donated_delegation_adds_and_withdraws_inventory() {
        let mut policy = UnitBrokerPolicy::new(ActorId::named("broker"));
        let mut record = DelegationRecord::new(
            DelegationId::new(),
            "pool",
            crate::delegation::DelegationRole::Holder,
            SliceId::new(),
            "inventory",
        );
        record.graph = Some(r#"{"vm":6}"#.to_string());
        record.peer = Some(ActorId::named("site"));
        record.state = DelegationState::Delegated;

        policy.donate_delegation(&record).unwrap();
        policy.update_delegation_complete(&record);
        assert_eq!(policy.available(&ResourceType::from("vm")), 6);

        let mut r = request(2);
        assert!(policy.bind(&mut r, 0).unwrap());
        assert!(matches!(
            r.approved_resources().unwrap().concrete,
            Some(ConcreteSet::Ticket { delegation: Some(d), .. }) if d == record.delegation_id
        ));

        policy.closed_delegation(&record);
        assert_eq!(policy.available(&ResourceType::from("vm")), 0);
    }

    #[test]
    fn expired_allocations_are_closing() {
        let mut policy = broker(4);
        let mut r = request(1);
        policy.bind(&mut r, 0).unwrap();
        let clock = ActorClock::new(Utc::now(), 1_000);
        assert!(policy.get_closing(0, &clock).is_empty());
        assert_eq!(
            policy.get_closing(2 * 3_600, &clock),
            vec![r.reservation_id()]
        );
    }
}

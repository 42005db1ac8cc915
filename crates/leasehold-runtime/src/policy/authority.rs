//! Reference authority policy.
//!
//! Owns named units (`vm-0`, `vm-1`, ...) per resource type. A redeem must
//! present a broker ticket; the units it names are taken from the free
//! list and returned when the lease closes.

use super::{parse_unit_graph, AuthorityPolicy, Policy, PolicyError};
use crate::actor::ActorClock;
use crate::config::PolicyConfig;
use crate::delegation::DelegationRecord;
use crate::reservation::{ReservationCore, ReservationRecord};
use chrono::{DateTime, Utc};
use leasehold_types::{
    ActorId, ConcreteSet, DelegationId, ReservationId, ResourceSet, ResourceType,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct Inventory {
    total: u32,
    free: BTreeSet<String>,
}

#[derive(Debug, Clone)]
struct Lease {
    rtype: ResourceType,
    assigned: Vec<String>,
    end: DateTime<Utc>,
}

#[derive(Debug)]
pub struct UnitAuthorityPolicy {
    identity: ActorId,
    inventory: BTreeMap<ResourceType, Inventory>,
    leases: HashMap<ReservationId, Lease>,
    advertised: HashMap<DelegationId, BTreeMap<ResourceType, u32>>,
}

impl UnitAuthorityPolicy {
    #[must_use]
    pub fn new(identity: ActorId) -> Self {
        Self {
            identity,
            inventory: BTreeMap::new(),
            leases: HashMap::new(),
            advertised: HashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(identity: ActorId, config: &PolicyConfig) -> Self {
        config
            .inventory
            .iter()
            .fold(Self::new(identity), |policy, (rtype, units)| {
                policy.with_inventory(rtype.as_str(), *units)
            })
    }

    /// Adds `units` freshly named units of a type.
    #[must_use]
    pub fn with_inventory(mut self, rtype: impl Into<ResourceType>, units: u32) -> Self {
        let rtype = rtype.into();
        let inventory = self.inventory.entry(rtype.clone()).or_default();
        let first = inventory.total;
        for i in first..first + units {
            inventory.free.insert(format!("{rtype}-{i}"));
        }
        inventory.total += units;
        self
    }

    #[must_use]
    pub fn identity(&self) -> ActorId {
        self.identity
    }

    #[must_use]
    pub fn available(&self, rtype: &ResourceType) -> u32 {
        self.inventory
            .get(rtype)
            .map_or(0, |i| u32::try_from(i.free.len()).unwrap_or(u32::MAX))
    }

    fn take_units(&mut self, rtype: &ResourceType, count: u32) -> Result<Vec<String>, PolicyError> {
        let inventory = self
            .inventory
            .get_mut(rtype)
            .ok_or_else(|| PolicyError::UnknownResourceType(rtype.clone()))?;
        let free = u32::try_from(inventory.free.len()).unwrap_or(u32::MAX);
        if count > free {
            return Err(PolicyError::insufficient(rtype, count, free));
        }
        let mut taken = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if let Some(name) = inventory.free.pop_first() {
                taken.push(name);
            }
        }
        Ok(taken)
    }

    fn return_units(&mut self, rtype: &ResourceType, units: impl IntoIterator<Item = String>) {
        if let Some(inventory) = self.inventory.get_mut(rtype) {
            inventory.free.extend(units);
        }
    }

    fn end_lease(&mut self, rid: &ReservationId) {
        if let Some(lease) = self.leases.remove(rid) {
            debug!(rid = %rid, "returning {} units", lease.assigned.len());
            self.return_units(&lease.rtype, lease.assigned);
        }
    }

    fn leased(rtype: &ResourceType, assigned: Vec<String>) -> ResourceSet {
        let units = u32::try_from(assigned.len()).unwrap_or(u32::MAX);
        ResourceSet::new(units, rtype.clone()).with_concrete(ConcreteSet::Units { assigned })
    }
}

/// Units named by the ticket a redeem presents.
fn ticket_units(requested: &ResourceSet) -> Result<u32, PolicyError> {
    match &requested.concrete {
        Some(ConcreteSet::Ticket { units, .. }) => {
            if *units < requested.units {
                return Err(PolicyError::invalid_ticket(format!(
                    "ticket covers {} units, {} requested",
                    units, requested.units
                )));
            }
            Ok(requested.units)
        }
        Some(ConcreteSet::Units { .. }) => {
            Err(PolicyError::invalid_ticket("a lease is not a ticket"))
        }
        None => Err(PolicyError::invalid_ticket("no ticket presented")),
    }
}

impl Policy for UnitAuthorityPolicy {
    fn name(&self) -> &'static str {
        "unit-authority"
    }

    fn close(&mut self, reservation: &ReservationCore) {
        self.end_lease(&reservation.reservation_id());
    }

    fn release(&mut self, reservation: &ReservationCore) {
        self.end_lease(&reservation.reservation_id());
    }

    fn closed_delegation(&mut self, delegation: &DelegationRecord) {
        self.advertised.remove(&delegation.delegation_id);
    }

    fn get_closing(&mut self, cycle: u64, clock: &ActorClock) -> Vec<ReservationId> {
        let now = clock.cycle_start(cycle);
        let mut expired: Vec<ReservationId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.end < now)
            .map(|(rid, _)| *rid)
            .collect();
        expired.sort();
        expired
    }

    fn revisit(&mut self, reservation: &ReservationRecord) {
        if reservation.state.is_terminal() {
            return;
        }
        let (Some(resources), Some(term)) = (&reservation.resources, reservation.term) else {
            return;
        };
        let Some(ConcreteSet::Units { assigned }) = &resources.concrete else {
            return;
        };
        if let Some(inventory) = self.inventory.get_mut(&resources.rtype) {
            for name in assigned {
                inventory.free.remove(name);
            }
        }
        self.leases.insert(
            reservation.reservation_id,
            Lease {
                rtype: resources.rtype.clone(),
                assigned: assigned.clone(),
                end: term.end(),
            },
        );
    }

    fn revisit_delegation(&mut self, delegation: &DelegationRecord) {
        if delegation.state.is_terminal() {
            return;
        }
        if let Err(e) = self.bind_delegation(delegation) {
            warn!(did = %delegation.delegation_id, "cannot restore advertisement: {}", e);
        }
    }

    fn query(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        for (rtype, inventory) in &self.inventory {
            stats.insert(format!("inventory.{rtype}.total"), inventory.total.to_string());
            stats.insert(
                format!("inventory.{rtype}.free"),
                inventory.free.len().to_string(),
            );
        }
        stats.insert("leases".to_string(), self.leases.len().to_string());
        stats.insert("delegations".to_string(), self.advertised.len().to_string());
        stats
    }

    fn as_authority_mut(&mut self) -> Option<&mut dyn AuthorityPolicy> {
        Some(self)
    }
}

impl AuthorityPolicy for UnitAuthorityPolicy {
    fn bind(&mut self, reservation: &mut ReservationCore, _cycle: u64) -> Result<bool, PolicyError> {
        let rid = reservation.reservation_id();
        let requested = reservation.requested_resources().clone();
        let term = reservation
            .requested_term()
            .copied()
            .ok_or_else(|| PolicyError::invalid_request("no term presented"))?;
        let count = ticket_units(&requested)?;

        self.end_lease(&rid);
        let assigned = self.take_units(&requested.rtype, count)?;
        let mut resources = Self::leased(&requested.rtype, assigned.clone());
        resources.data = requested.data.clone();
        self.leases.insert(
            rid,
            Lease {
                rtype: requested.rtype.clone(),
                assigned,
                end: term.end(),
            },
        );
        reservation.approve(term, resources);
        Ok(true)
    }

    fn extend_authority(
        &mut self,
        reservation: &mut ReservationCore,
        _cycle: u64,
    ) -> Result<bool, PolicyError> {
        let rid = reservation.reservation_id();
        let requested = reservation.requested_resources().clone();
        let term = reservation
            .requested_term()
            .copied()
            .ok_or_else(|| PolicyError::invalid_request("no term presented"))?;
        let count = ticket_units(&requested)?;
        let mut lease = self
            .leases
            .remove(&rid)
            .ok_or_else(|| PolicyError::invalid_request(format!("{rid} holds no lease")))?;

        let held = u32::try_from(lease.assigned.len()).unwrap_or(u32::MAX);
        if count > held {
            match self.take_units(&lease.rtype, count - held) {
                Ok(extra) => lease.assigned.extend(extra),
                Err(e) => {
                    self.leases.insert(rid, lease);
                    return Err(e);
                }
            }
        } else if count < held {
            let surplus = lease.assigned.split_off(count as usize);
            self.return_units(&lease.rtype, surplus);
        }

        lease.end = term.end();
        let mut resources = Self::leased(&lease.rtype, lease.assigned.clone());
        resources.data = requested.data.clone();
        if let Some(current) = reservation.resources() {
            resources.data.merge(&current.data);
        }
        self.leases.insert(rid, lease);
        reservation.approve(term, resources);
        Ok(true)
    }

    fn bind_delegation(&mut self, delegation: &DelegationRecord) -> Result<bool, PolicyError> {
        let graph = delegation
            .graph
            .as_deref()
            .ok_or_else(|| PolicyError::InvalidGraph("no graph".to_string()))?;
        let units = parse_unit_graph(graph)?;

        for (rtype, count) in &units {
            let total = self
                .inventory
                .get(rtype)
                .map(|i| i.total)
                .ok_or_else(|| PolicyError::UnknownResourceType(rtype.clone()))?;
            let promised: u32 = self
                .advertised
                .iter()
                .filter(|(did, _)| **did != delegation.delegation_id)
                .filter_map(|(_, graph)| graph.get(rtype))
                .sum();
            if promised + count > total {
                return Err(PolicyError::insufficient(
                    rtype,
                    *count,
                    total.saturating_sub(promised),
                ));
            }
        }
        self.advertised.insert(delegation.delegation_id, units);
        Ok(true)
    }
}

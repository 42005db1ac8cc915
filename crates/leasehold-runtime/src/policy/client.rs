//! Reference controller policy.
//!
//! Tickets every demanded reservation on the next tick, redeems tickets as
//! soon as they arrive, and renews renewable leases shortly before they
//! end.

use super::{Bids, ClientPolicy, Policy, PolicyError};
use crate::actor::ActorClock;
use crate::reservation::{ReservationCore, ReservationRecord};
use leasehold_types::{ReservationId, ReservationPendingState, ReservationState, Term};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::debug;

/// Cycles before the end of a term at which renewal starts.
pub const RENEW_LEAD_CYCLES: u64 = 2;

#[derive(Debug, Clone)]
struct Holding {
    state: ReservationState,
    pending: ReservationPendingState,
    term: Option<Term>,
    renewable: bool,
}

impl Holding {
    fn from_record(record: &ReservationRecord) -> Self {
        Self {
            state: record.state,
            pending: record.pending,
            term: record.term,
            renewable: record.renewable,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimpleClientPolicy {
    demand: VecDeque<ReservationId>,
    redeeming: VecDeque<ReservationId>,
    holdings: HashMap<ReservationId, Holding>,
    renewing: HashSet<ReservationId>,
}

impl SimpleClientPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn track(&mut self, record: &ReservationRecord) {
        if record.state.is_terminal() {
            self.forget(&record.reservation_id);
        } else {
            self.holdings
                .insert(record.reservation_id, Holding::from_record(record));
        }
    }

    fn forget(&mut self, rid: &ReservationId) {
        self.holdings.remove(rid);
        self.renewing.remove(rid);
        self.demand.retain(|r| r != rid);
        self.redeeming.retain(|r| r != rid);
    }
}

impl Policy for SimpleClientPolicy {
    fn name(&self) -> &'static str {
        "simple-client"
    }

    fn close(&mut self, reservation: &ReservationCore) {
        self.forget(&reservation.reservation_id());
    }

    fn get_closing(&mut self, cycle: u64, clock: &ActorClock) -> Vec<ReservationId> {
        let now = clock.cycle_start(cycle);
        let mut closing: Vec<ReservationId> = self
            .holdings
            .iter()
            .filter(|(_, h)| !h.renewable && h.pending.is_none())
            .filter(|(_, h)| h.term.is_some_and(|t| t.expired(now)))
            .map(|(rid, _)| *rid)
            .collect();
        closing.sort();
        closing
    }

    fn revisit(&mut self, reservation: &ReservationRecord) {
        self.track(reservation);
    }

    fn query(&self) -> BTreeMap<String, String> {
        let mut stats = BTreeMap::new();
        stats.insert("holdings".to_string(), self.holdings.len().to_string());
        stats.insert("demand".to_string(), self.demand.len().to_string());
        stats.insert("redeeming".to_string(), self.redeeming.len().to_string());
        stats
    }

    fn as_client_mut(&mut self) -> Option<&mut dyn ClientPolicy> {
        Some(self)
    }
}

impl ClientPolicy for SimpleClientPolicy {
    fn demand(&mut self, reservation: &ReservationRecord) -> Result<(), PolicyError> {
        if reservation.requested_resources.is_empty() {
            return Err(PolicyError::invalid_request("zero units demanded"));
        }
        if reservation.requested_term.is_none() {
            return Err(PolicyError::invalid_request("no term requested"));
        }
        self.track(reservation);
        if !self.demand.contains(&reservation.reservation_id) {
            self.demand.push_back(reservation.reservation_id);
        }
        Ok(())
    }

    fn formulate_bids(&mut self, cycle: u64, clock: &ActorClock) -> Bids {
        let horizon = clock.cycle_end(cycle + RENEW_LEAD_CYCLES);
        let mut bids = Bids {
            ticketing: self.demand.drain(..).collect(),
            extending: Vec::new(),
        };

        for (rid, holding) in &self.holdings {
            if !holding.renewable
                || holding.state != ReservationState::Active
                || !holding.pending.is_none()
                || self.renewing.contains(rid)
            {
                continue;
            }
            let Some(term) = holding.term else { continue };
            if term.end() <= horizon {
                let step = term.end() - term.new_start();
                let step = if step > chrono::Duration::zero() { step } else { term.length() };
                bids.extending.push((*rid, term.extend(step)));
            }
        }
        bids.extending.sort_by_key(|(rid, _)| *rid);
        for (rid, _) in &bids.extending {
            self.renewing.insert(*rid);
        }
        if !bids.is_empty() {
            debug!(
                "cycle {}: {} to ticket, {} to extend",
                cycle,
                bids.ticketing.len(),
                bids.extending.len()
            );
        }
        bids
    }

    fn get_redeeming(&mut self, _cycle: u64, _clock: &ActorClock) -> Vec<ReservationId> {
        self.redeeming.drain(..).collect()
    }

    fn update_ticket_complete(&mut self, reservation: &ReservationRecord) {
        self.track(reservation);
        if reservation.pending.is_none()
            && matches!(
                reservation.state,
                ReservationState::Ticketed | ReservationState::ActiveTicketed
            )
            && !self.redeeming.contains(&reservation.reservation_id)
        {
            self.redeeming.push_back(reservation.reservation_id);
        }
    }

    fn update_lease_complete(&mut self, reservation: &ReservationRecord) {
        self.track(reservation);
        if reservation.state == ReservationState::Active {
            self.renewing.remove(&reservation.reservation_id);
        }
    }
}

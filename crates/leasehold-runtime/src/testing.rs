//! Fixtures shared by unit tests.

use crate::actor::ActorClock;
use crate::context::{OpContext, Outbound, Outbox};
use crate::policy::Policy;
use chrono::{Duration, Utc};
use leasehold_types::{AuthToken, Term};

/// Owns everything an [`OpContext`] borrows.
pub(crate) struct Harness<P: Policy> {
    pub policy: P,
    pub outbox: Outbox,
    pub clock: ActorClock,
    pub identity: AuthToken,
    pub cycle: u64,
}

impl<P: Policy> Harness<P> {
    pub fn new(name: &str, policy: P) -> Self {
        Self {
            policy,
            outbox: Outbox::new(),
            clock: ActorClock::new(Utc::now(), 1_000),
            identity: AuthToken::named(name),
            cycle: 1,
        }
    }

    pub fn ctx(&mut self) -> OpContext<'_> {
        OpContext {
            policy: &mut self.policy,
            outbox: &mut self.outbox,
            clock: &self.clock,
            identity: &self.identity,
            cycle: self.cycle,
        }
    }

    pub fn sent(&mut self) -> Vec<Outbound> {
        self.outbox.drain()
    }
}

pub(crate) fn hour_term() -> Term {
    Term::starting_at(Utc::now(), Duration::hours(1)).unwrap()
}

//! Cycle driver.

use super::{ActorClock, ActorHandle};
use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// Sends `Tick(cycle)` to an actor once per clock period.
///
/// A cycle is delivered at most once; if the task falls behind, skipped
/// cycles are not replayed.
#[derive(Debug)]
pub struct Ticker {
    clock: ActorClock,
    handle: ActorHandle,
}

impl Ticker {
    #[must_use]
    pub fn new(clock: ActorClock, handle: ActorHandle) -> Self {
        Self { clock, handle }
    }

    /// Runs on a spawned task until the actor stops.
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.clock.cycle_millis()));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last = None;
        loop {
            interval.tick().await;
            let cycle = self.clock.cycle(Utc::now());
            if last == Some(cycle) {
                continue;
            }
            last = Some(cycle);
            if self.handle.tick(cycle).is_err() {
                debug!(actor = %self.handle.identity().name, "ticker stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Actor, ActorEvent};
    use super::*;
    use crate::config::RpcConfig;
    use crate::policy::SimpleClientPolicy;
    use crate::store::MemoryStore;
    use leasehold_types::{ActorRole, AuthToken};
    use std::sync::Arc;

    fn actor(cycle_millis: u64) -> Actor {
        Actor::new(
            AuthToken::named("ctl"),
            ActorRole::Controller,
            ActorClock::new(Utc::now(), cycle_millis),
            Box::new(SimpleClientPolicy::new()),
            Arc::new(MemoryStore::new()),
            RpcConfig::default(),
        )
    }

    #[tokio::test]
    async fn delivers_increasing_cycles() {
        let mut actor = actor(20);
        let ticker = Ticker::new(actor.clock(), actor.handle()).spawn();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(5), actor.events.recv()).await {
                Ok(Some(ActorEvent::Tick(cycle))) => seen.push(cycle),
                Ok(Some(_)) => {}
                other => panic!("no tick: {other:?}"),
            }
        }
        ticker.abort();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn stops_when_actor_is_gone() {
        let mut actor = actor(10);
        let ticker = Ticker::new(actor.clock(), actor.handle()).spawn();
        actor.events.close();
        tokio::time::timeout(Duration::from_secs(5), ticker)
            .await
            .expect("ticker did not stop")
            .unwrap();
    }
}

//! In-process controller, broker and site authority.

use anyhow::{Context, Result};
use chrono::{Duration as TermLength, Utc};
use leasehold_runtime::{
    Actor, ActorHandle, KernelError, LeaseholdConfig, LocalProxy, ReservationRecord,
    ReservationRole, Slice, Ticker,
};
use leasehold_types::{ActorId, ActorRole, ReservationId, ResourceSet, SliceKind, Term};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const CONTROLLER: &str = "controller";
pub const BROKER: &str = "broker";
pub const SITE: &str = "site";

/// Per-actor copy of the shared configuration.
fn actor_config(base: &LeaseholdConfig, name: &str, role: ActorRole) -> LeaseholdConfig {
    let mut config = base.clone();
    config.actor.name = name.to_string();
    config.actor.role = role;
    if let Some(dir) = &base.store.data_dir {
        config.store.data_dir = Some(dir.join(name));
    }
    config
}

fn link(a: &ActorHandle, b: &ActorHandle) {
    a.rpc()
        .register_proxy(Arc::new(LocalProxy::new(b.identity().guid, b.rpc())));
    b.rpc()
        .register_proxy(Arc::new(LocalProxy::new(a.identity().guid, a.rpc())));
}

/// What the controller asks for.
#[derive(Debug, Clone)]
pub struct Demand {
    pub count: u32,
    pub units: u32,
    pub rtype: String,
    pub length: TermLength,
}

pub struct Trio {
    controller: ActorHandle,
    broker: ActorHandle,
    site: ActorHandle,
    tasks: Vec<JoinHandle<()>>,
    tickers: Vec<JoinHandle<()>>,
}

impl Trio {
    /// Builds, recovers and starts all three actors. With `realtime`, each
    /// actor is driven by its own [`Ticker`]; otherwise call [`step`](Self::step).
    pub fn start(base: &LeaseholdConfig, realtime: bool) -> Result<Self> {
        let site_id = ActorId::named(SITE);
        let mut handles = Vec::new();
        let mut tasks = Vec::new();
        let mut tickers = Vec::new();
        for (name, role, authority) in [
            (CONTROLLER, ActorRole::Controller, None),
            (BROKER, ActorRole::Broker, Some(site_id)),
            (SITE, ActorRole::Authority, None),
        ] {
            let config = actor_config(base, name, role);
            let mut actor = Actor::from_config(&config, authority)
                .with_context(|| format!("cannot build {name}"))?;
            actor
                .recover()
                .with_context(|| format!("cannot recover {name}"))?;
            let handle = actor.handle();
            if realtime {
                tickers.push(Ticker::new(actor.clock(), handle.clone()).spawn());
            }
            tasks.push(tokio::spawn(actor.run()));
            handles.push(handle);
        }
        let site = handles.pop().context("site missing")?;
        let broker = handles.pop().context("broker missing")?;
        let controller = handles.pop().context("controller missing")?;
        link(&controller, &broker);
        link(&controller, &site);
        link(&broker, &site);
        info!("trio started");
        Ok(Self {
            controller,
            broker,
            site,
            tasks,
            tickers,
        })
    }

    fn handles(&self) -> [&ActorHandle; 3] {
        [&self.controller, &self.broker, &self.site]
    }

    /// Registers a slice on the controller and demands `demand.count`
    /// reservations in it.
    pub async fn request(&self, demand: Demand) -> Result<Vec<ReservationId>> {
        let broker = self.broker.identity().guid;
        let ids = self
            .controller
            .execute(move |w| {
                let me = w.identity().clone();
                let slice_id = w.register_slice(Slice::new("demo", me.clone(), SliceKind::Client))?;
                let term = Term::starting_at(Utc::now(), demand.length)?;
                let mut ids = Vec::new();
                for _ in 0..demand.count {
                    let mut record = ReservationRecord::new(
                        ReservationRole::Client,
                        slice_id,
                        "demo",
                        ResourceSet::new(demand.units, demand.rtype.as_str()),
                        Some(term),
                    );
                    record.broker = Some(broker);
                    let rid = w.register_reservation(record, &me)?;
                    w.demand(&rid, &me)?;
                    ids.push(rid);
                }
                Ok::<_, KernelError>(ids)
            })
            .await??;
        Ok(ids)
    }

    /// Waits until every message in flight has been processed.
    pub async fn settle(&self) -> Result<()> {
        for _ in 0..4 {
            for h in self.handles() {
                h.rpc().wait_idle().await;
                h.execute(|_| ()).await?;
            }
        }
        Ok(())
    }

    /// Runs one cycle on every actor.
    pub async fn step(&self, cycle: u64) -> Result<()> {
        debug!(cycle, "step");
        for h in self.handles() {
            h.tick(cycle)?;
        }
        self.settle().await
    }

    pub async fn run(&self, cycles: u64, cycle_millis: u64, realtime: bool) -> Result<()> {
        if realtime {
            tokio::time::sleep(Duration::from_millis(cycles * cycle_millis)).await;
            return self.settle().await;
        }
        for cycle in 1..=cycles {
            self.step(cycle).await?;
        }
        Ok(())
    }

    /// The controller's reservations, ordered by slice then id.
    pub async fn reservations(&self) -> Result<Vec<ReservationRecord>> {
        let mut records = self
            .controller
            .execute(|w| {
                w.kernel()
                    .reservations()
                    .map(|r| r.record().clone())
                    .collect::<Vec<_>>()
            })
            .await?;
        records.sort_by(|a, b| {
            (&a.slice_name, a.reservation_id).cmp(&(&b.slice_name, b.reservation_id))
        });
        Ok(records)
    }

    pub async fn shutdown(self) -> Result<()> {
        for ticker in &self.tickers {
            ticker.abort();
        }
        for h in self.handles() {
            h.shutdown()?;
        }
        for task in self.tasks {
            task.await?;
        }
        info!("trio stopped");
        Ok(())
    }
}

/// Fixed-width table of reservation records.
pub fn render_table(records: &[ReservationRecord]) -> String {
    let mut out = format!(
        "{:<10} {:<10} {:<16} {:<16} {:>5}  {}\n",
        "ID", "SLICE", "STATE", "PENDING", "UNITS", "TERM END"
    );
    for r in records {
        let id: String = r.reservation_id.to_string().chars().take(8).collect();
        let end = r
            .term
            .map_or_else(|| "-".to_string(), |t| t.end().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        let _ = writeln!(
            out,
            "{:<10} {:<10} {:<16} {:<16} {:>5}  {}",
            id,
            r.slice_name,
            r.state.to_string(),
            r.pending.to_string(),
            r.units(),
            end
        );
    }
    out
}

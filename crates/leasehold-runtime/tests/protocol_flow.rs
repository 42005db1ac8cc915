//! End-to-end flows between a controller, a broker and a site authority
//! running in one process over [`LocalProxy`].

use async_trait::async_trait;
use chrono::{Duration as TermLength, Utc};
use leasehold_event::RpcMessage;
use leasehold_runtime::{
    Actor, ActorClock, ActorHandle, ActorStore, DelegationRecord, DelegationRole, FileStore,
    KernelError, LocalProxy, MemoryStore, Policy, Proxy, ReservationRecord, ReservationRole,
    RpcConfig, SimpleClientPolicy, Slice, TransportError, UnitAuthorityPolicy, UnitBrokerPolicy,
};
use leasehold_types::{
    ActorId, ActorRole, AuthToken, DelegationState, ReservationId, ReservationState, ResourceSet,
    SliceId, SliceKind, Term,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const MAX_CYCLES: usize = 12;

fn spawn(
    name: &str,
    role: ActorRole,
    policy: Box<dyn Policy>,
    store: Arc<dyn ActorStore>,
    rpc: RpcConfig,
) -> (ActorHandle, JoinHandle<()>) {
    let actor = Actor::new(
        AuthToken::named(name),
        role,
        ActorClock::new(Utc::now(), 1_000),
        policy,
        store,
        rpc,
    );
    let handle = actor.handle();
    (handle, tokio::spawn(actor.run()))
}

fn link(a: &ActorHandle, b: &ActorHandle) {
    a.rpc()
        .register_proxy(Arc::new(LocalProxy::new(b.identity().guid, b.rpc())));
    b.rpc()
        .register_proxy(Arc::new(LocalProxy::new(a.identity().guid, a.rpc())));
}

fn broker_policy(units: u32) -> Box<dyn Policy> {
    let policy = UnitBrokerPolicy::new(ActorId::named("broker"));
    if units == 0 {
        Box::new(policy)
    } else {
        Box::new(policy.with_inventory("vm", units, Some(ActorId::named("site"))))
    }
}

fn site_policy(units: u32) -> Box<dyn Policy> {
    Box::new(UnitAuthorityPolicy::new(ActorId::named("site")).with_inventory("vm", units))
}

fn hour() -> Term {
    Term::starting_at(Utc::now(), TermLength::hours(1)).unwrap()
}

struct Net {
    ctl: ActorHandle,
    broker: ActorHandle,
    site: ActorHandle,
    tasks: Vec<JoinHandle<()>>,
    cycle: u64,
}

impl Net {
    fn start(broker_units: u32, ctl_store: Arc<dyn ActorStore>) -> Self {
        let (ctl, t1) = spawn(
            "ctl",
            ActorRole::Controller,
            Box::new(SimpleClientPolicy::new()),
            ctl_store,
            RpcConfig::default(),
        );
        let (broker, t2) = spawn(
            "broker",
            ActorRole::Broker,
            broker_policy(broker_units),
            Arc::new(MemoryStore::new()),
            RpcConfig::default(),
        );
        let (site, t3) = spawn(
            "site",
            ActorRole::Authority,
            site_policy(8),
            Arc::new(MemoryStore::new()),
            RpcConfig::default(),
        );
        link(&ctl, &broker);
        link(&ctl, &site);
        link(&broker, &site);
        Self {
            ctl,
            broker,
            site,
            tasks: vec![t1, t2, t3],
            cycle: 0,
        }
    }

    fn handles(&self) -> [&ActorHandle; 3] {
        [&self.ctl, &self.broker, &self.site]
    }

    /// Lets every message in flight land and be processed.
    async fn settle(&self) {
        for _ in 0..4 {
            for h in self.handles() {
                h.rpc().wait_idle().await;
                h.execute(|_| ()).await.unwrap();
            }
        }
    }

    async fn tick(&mut self) {
        self.cycle += 1;
        for h in self.handles() {
            h.tick(self.cycle).unwrap();
        }
        self.settle().await;
    }

    async fn run_until<P>(&mut self, rid: ReservationId, what: &str, done: P)
    where
        P: Fn(&ReservationRecord) -> bool + Send + Copy + 'static,
    {
        for _ in 0..MAX_CYCLES {
            if client_record(&self.ctl, rid).await.is_some_and(|r| done(&r)) {
                return;
            }
            self.tick().await;
        }
        let last = client_record(&self.ctl, rid).await;
        panic!("{what} not reached by cycle {}: {last:?}", self.cycle);
    }

    async fn stop(self) {
        for h in self.handles() {
            let _ = h.shutdown();
        }
        for t in self.tasks {
            t.await.unwrap();
        }
    }
}

async fn client_record(handle: &ActorHandle, rid: ReservationId) -> Option<ReservationRecord> {
    handle
        .execute(move |w| w.kernel().reservation(&rid).map(|r| r.record().clone()))
        .await
        .unwrap()
}

/// Registers a client slice and a two-unit reservation, optionally with
/// a fixed id, and returns both ids.
async fn client_reservation(
    ctl: &ActorHandle,
    rid: Option<ReservationId>,
) -> (SliceId, ReservationId) {
    ctl.execute(move |w| {
        let me = w.identity().clone();
        let slice_id = w.register_slice(Slice::new("web", me.clone(), SliceKind::Client))?;
        let resources = ResourceSet::new(2, "vm");
        let mut record = match rid {
            Some(rid) => ReservationRecord::with_id(
                rid,
                ReservationRole::Client,
                slice_id,
                "web",
                resources,
                Some(hour()),
            ),
            None => ReservationRecord::new(
                ReservationRole::Client,
                slice_id,
                "web",
                resources,
                Some(hour()),
            ),
        };
        record.broker = Some(ActorId::named("broker"));
        let rid = w.register_reservation(record, &me)?;
        Ok::<_, KernelError>((slice_id, rid))
    })
    .await
    .unwrap()
    .unwrap()
}

async fn demand(ctl: &ActorHandle) -> ReservationId {
    let (_, rid) = client_reservation(ctl, None).await;
    ctl.execute(move |w| {
        let me = w.identity().clone();
        w.demand(&rid, &me)
    })
    .await
    .unwrap()
    .unwrap();
    rid
}

fn is(state: ReservationState) -> impl Fn(&ReservationRecord) -> bool + Send + Copy + 'static {
    move |r| r.state == state && r.pending.is_none()
}

#[tokio::test]
async fn ticket_redeem_extend_close() {
    let mut net = Net::start(4, Arc::new(MemoryStore::new()));
    let rid = demand(&net.ctl).await;

    net.run_until(rid, "active lease", is(ReservationState::Active)).await;
    let held = client_record(&net.ctl, rid).await.unwrap();
    assert_eq!(held.units(), 2);
    assert_eq!(held.authority, Some(ActorId::named("site")));
    assert_eq!(
        client_record(&net.broker, rid).await.unwrap().state,
        ReservationState::Ticketed
    );

    let stats = net.ctl.query(net.site.identity().guid).await.unwrap();
    assert_eq!(stats["reservations.Active"], "1");

    let old_end = held.term.unwrap().end();
    let longer = held.term.unwrap().extend(TermLength::hours(1));
    net.ctl
        .execute(move |w| {
            let me = w.identity().clone();
            w.extend_ticket(&rid, longer, &me)
        })
        .await
        .unwrap()
        .unwrap();
    let new_end = longer.end();
    net.run_until(rid, "extended lease", move |r| {
        r.state == ReservationState::Active
            && r.pending.is_none()
            && r.term.is_some_and(|t| t.end() == new_end)
    })
    .await;
    assert!(new_end > old_end);

    net.ctl
        .execute(move |w| {
            let me = w.identity().clone();
            w.close(&rid, &me)
        })
        .await
        .unwrap()
        .unwrap();
    net.run_until(rid, "closed", is(ReservationState::Closed)).await;
    assert_eq!(
        client_record(&net.site, rid).await.unwrap().state,
        ReservationState::Closed
    );
    net.stop().await;
}

#[tokio::test]
async fn delegated_pool_backs_an_empty_broker() {
    let mut net = Net::start(0, Arc::new(MemoryStore::new()));

    let did = net
        .site
        .execute(|w| {
            let me = w.identity().clone();
            let pool = w.register_slice(Slice::new("pool", me.clone(), SliceKind::Inventory))?;
            w.advertise(
                pool,
                "vms",
                r#"{"vm":4}"#.to_string(),
                ActorId::named("broker"),
                &me,
            )
        })
        .await
        .unwrap()
        .unwrap();

    net.broker
        .execute(move |w| {
            let me = w.identity().clone();
            let slice = w.register_slice(Slice::new("pool", me.clone(), SliceKind::Inventory))?;
            let mut record =
                DelegationRecord::new(did, "vms", DelegationRole::Holder, slice, "pool");
            record.exported = true;
            record.peer = Some(ActorId::named("site"));
            w.register_delegation(record, &me)?;
            w.claim_delegation(&did, &me)
        })
        .await
        .unwrap()
        .unwrap();
    net.tick().await;

    let graph = net
        .broker
        .execute(move |w| {
            let d = w.kernel().delegation(&did).unwrap();
            (d.state(), d.record().graph.clone())
        })
        .await
        .unwrap();
    assert_eq!(graph, (DelegationState::Delegated, Some(r#"{"vm":4}"#.to_string())));

    let rid = demand(&net.ctl).await;
    net.run_until(rid, "active lease", is(ReservationState::Active)).await;
    net.stop().await;
}

#[tokio::test]
async fn exported_ticket_is_claimed_and_redeemed() {
    let mut net = Net::start(4, Arc::new(MemoryStore::new()));
    let ctl_id = net.ctl.identity().guid;

    let rid = net
        .broker
        .execute(move |w| {
            let me = w.identity().clone();
            let slice = w.register_slice(Slice::new("gift", me.clone(), SliceKind::Inventory))?;
            w.export(slice, ResourceSet::new(2, "vm"), hour(), ctl_id, &me)
        })
        .await
        .unwrap()
        .unwrap();

    client_reservation(&net.ctl, Some(rid)).await;
    net.ctl
        .execute(move |w| {
            let me = w.identity().clone();
            w.claim(&rid, &me)
        })
        .await
        .unwrap()
        .unwrap();

    net.run_until(rid, "claimed ticket", |r| {
        matches!(r.state, ReservationState::Ticketed | ReservationState::Active)
    })
    .await;
    net.run_until(rid, "active lease", is(ReservationState::Active)).await;
    net.stop().await;
}

#[tokio::test]
async fn ticket_into_someone_elses_slice_is_refused() {
    let mut net = Net::start(4, Arc::new(MemoryStore::new()));
    let rid = demand(&net.ctl).await;
    net.run_until(rid, "active lease", is(ReservationState::Active)).await;
    let slice_id = client_record(&net.ctl, rid).await.unwrap().slice_id;

    let (mallory, task) = spawn(
        "mallory",
        ActorRole::Controller,
        Box::new(SimpleClientPolicy::new()),
        Arc::new(MemoryStore::new()),
        RpcConfig::default(),
    );
    link(&mallory, &net.broker);
    let sneaky = mallory
        .execute(move |w| {
            let me = w.identity().clone();
            w.register_slice(Slice::with_id(slice_id, "web", me.clone(), SliceKind::Client))?;
            let mut record = ReservationRecord::new(
                ReservationRole::Client,
                slice_id,
                "web",
                ResourceSet::new(2, "vm"),
                Some(hour()),
            );
            record.broker = Some(ActorId::named("broker"));
            let rid = w.register_reservation(record, &me)?;
            w.ticket(&rid, &me)?;
            Ok::<_, KernelError>(rid)
        })
        .await
        .unwrap()
        .unwrap();

    mallory.rpc().wait_idle().await;
    net.settle().await;
    mallory.execute(|_| ()).await.unwrap();

    let record = client_record(&mallory, sneaky).await.unwrap();
    assert_eq!(record.state, ReservationState::Failed);
    assert!(client_record(&net.broker, sneaky).await.is_none());

    mallory.shutdown().unwrap();
    task.await.unwrap();
    net.stop().await;
}

#[tokio::test]
async fn restarted_controller_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn ActorStore> = Arc::new(FileStore::new(dir.path()).unwrap());
    let mut net = Net::start(4, store);
    let rid = demand(&net.ctl).await;
    net.run_until(rid, "active lease", is(ReservationState::Active)).await;
    let before = client_record(&net.ctl, rid).await.unwrap();

    net.ctl.shutdown().unwrap();
    net.tasks.remove(0).await.unwrap();

    let mut actor = Actor::new(
        AuthToken::named("ctl"),
        ActorRole::Controller,
        ActorClock::new(Utc::now(), 1_000),
        Box::new(SimpleClientPolicy::new()),
        Arc::new(FileStore::new(dir.path()).unwrap()),
        RpcConfig::default(),
    );
    actor.recover().unwrap();
    let ctl = actor.handle();
    net.tasks.insert(0, tokio::spawn(actor.run()));
    link(&ctl, &net.broker);
    link(&ctl, &net.site);
    net.ctl = ctl;

    let after = client_record(&net.ctl, rid).await.unwrap();
    assert_eq!(after.state, ReservationState::Active);
    assert_eq!(after.term, before.term);
    assert_eq!(after.lease_sequence_out, before.lease_sequence_out);

    net.ctl
        .execute(move |w| {
            let me = w.identity().clone();
            w.close(&rid, &me)
        })
        .await
        .unwrap()
        .unwrap();
    net.run_until(rid, "closed", is(ReservationState::Closed)).await;
    net.stop().await;
}

/// Accepts every message and never answers.
struct Silent(ActorId);

#[async_trait]
impl Proxy for Silent {
    fn peer(&self) -> ActorId {
        self.0
    }

    async fn execute(&self, _message: RpcMessage) -> Result<(), TransportError> {
        Ok(())
    }
}

async fn wait_for_state(handle: &ActorHandle, rid: ReservationId, state: ReservationState) {
    for _ in 0..100 {
        if client_record(handle, rid).await.is_some_and(|r| r.state == state) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{rid} never reached {state}");
}

#[tokio::test]
async fn unanswered_claim_times_out() {
    let config = RpcConfig {
        claim_timeout_secs: 1,
        ..RpcConfig::default()
    };
    let (ctl, task) = spawn(
        "ctl",
        ActorRole::Controller,
        Box::new(SimpleClientPolicy::new()),
        Arc::new(MemoryStore::new()),
        config,
    );
    ctl.rpc()
        .register_proxy(Arc::new(Silent(ActorId::named("broker"))));

    let (_, rid) = client_reservation(&ctl, None).await;
    ctl.execute(move |w| {
        let me = w.identity().clone();
        w.claim(&rid, &me)
    })
    .await
    .unwrap()
    .unwrap();

    wait_for_state(&ctl, rid, ReservationState::Failed).await;
    assert_eq!(ctl.rpc().pending_count(), 0);
    ctl.shutdown().unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn unreachable_broker_fails_ticket_after_retries() {
    let (ctl, task) = spawn(
        "ctl",
        ActorRole::Controller,
        Box::new(SimpleClientPolicy::new()),
        Arc::new(MemoryStore::new()),
        RpcConfig::default(),
    );
    let (broker, broker_task) = spawn(
        "broker",
        ActorRole::Broker,
        broker_policy(4),
        Arc::new(MemoryStore::new()),
        RpcConfig::default(),
    );
    link(&ctl, &broker);
    broker.shutdown().unwrap();
    broker_task.await.unwrap();
    drop(broker);

    let rid = demand(&ctl).await;
    ctl.tick(1).unwrap();
    wait_for_state(&ctl, rid, ReservationState::Failed).await;
    ctl.shutdown().unwrap();
    task.await.unwrap();
}

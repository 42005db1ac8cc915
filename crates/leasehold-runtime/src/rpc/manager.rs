//! Per-actor RPC manager.
//!
//! ```text
//!  kernel ──dispatch──► enqueue ──► proxy.prepare ──► spawn ──► proxy.execute ──► peer
//!                         │                                         │ Err
//!                         └─ pending (claims, queries) ◄─timer      └─► FailedRpc event
//!
//!  peer ──► dispatch_incoming ──► revive pending ──► IncomingRpc / FailedRpc event
//! ```
//!
//! Every request is counted from `enqueue` until its execution task
//! finishes; [`RpcManager::wait_idle`] and
//! [`RpcManager::await_nothing_pending`] wait for that count to reach
//! zero. Requests that expect a response stay in the pending table until
//! the response arrives or their timer fires.

use super::error::{RpcError, TransportError};
use super::proxy::{Proxy, ProxyRegistry};
use super::request::RpcRequest;
use crate::actor::ActorEvent;
use crate::config::RpcConfig;
use leasehold_event::{FailureKind, RpcFailure, RpcMessage, RpcPayload, RpcRequestType};
use leasehold_types::{ActorId, AuthToken, ErrorCode, MessageId};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Answer to a [`RpcManager::query`].
pub type QueryResponse = Result<RpcMessage, RpcFailure>;

struct PendingRequest {
    request: RpcRequest,
    responder: Option<oneshot::Sender<QueryResponse>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingRequest {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct Inner {
    identity: AuthToken,
    proxies: ProxyRegistry,
    pending: Mutex<HashMap<MessageId, PendingRequest>>,
    queued: Mutex<usize>,
    idle: Condvar,
    idle_notify: Notify,
    events: mpsc::UnboundedSender<ActorEvent>,
    limiter: Option<Arc<Semaphore>>,
    config: RpcConfig,
}

impl Inner {
    fn increment(&self) {
        *self.queued.lock() += 1;
    }

    fn decrement(&self) {
        let mut queued = self.queued.lock();
        *queued = queued.saturating_sub(1);
        if *queued == 0 {
            self.idle.notify_all();
            self.idle_notify.notify_waiters();
        }
    }

    fn take_pending(&self, id: &MessageId) -> Option<PendingRequest> {
        let mut entry = self.pending.lock().remove(id)?;
        entry.cancel_timer();
        Some(entry)
    }

    fn timeout_for(&self, kind: RpcRequestType) -> Duration {
        match kind {
            RpcRequestType::Query => Duration::from_secs(self.config.query_timeout_secs),
            _ => Duration::from_secs(self.config.claim_timeout_secs),
        }
    }

    /// Fires when a pending request outlives its deadline.
    fn expire(&self, id: &MessageId) {
        let Some(mut entry) = self.pending.lock().remove(id) else {
            return;
        };
        warn!("{} timed out", entry.request);
        let failure = RpcFailure::new(
            FailureKind::Timeout,
            &entry.request.message,
            format!("no response within {:?}", self.timeout_for(entry.request.kind())),
        )
        .with_code(RpcError::Timeout(*id).code());
        if let Some(responder) = entry.responder.take() {
            let _ = responder.send(Err(failure.clone()));
        }
        let _ = self.events.send(ActorEvent::FailedRpc {
            failure,
            request: Some(entry.request),
            recoverable: false,
        });
    }
}

/// Outbound request dispatcher for one actor. Cheap to clone.
#[derive(Clone)]
pub struct RpcManager {
    inner: Arc<Inner>,
}

/// Non-owning handle, used by in-process proxies to reach a peer.
#[derive(Clone)]
pub struct WeakRpcManager {
    inner: Weak<Inner>,
}

impl WeakRpcManager {
    #[must_use]
    pub fn upgrade(&self) -> Option<RpcManager> {
        self.inner.upgrade().map(|inner| RpcManager { inner })
    }
}

impl RpcManager {
    /// Creates a manager that reports responses and failures on `events`.
    #[must_use]
    pub fn new(
        identity: AuthToken,
        config: RpcConfig,
        events: mpsc::UnboundedSender<ActorEvent>,
    ) -> Self {
        let limiter = config
            .max_in_flight
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            inner: Arc::new(Inner {
                identity,
                proxies: ProxyRegistry::new(),
                pending: Mutex::new(HashMap::new()),
                queued: Mutex::new(0),
                idle: Condvar::new(),
                idle_notify: Notify::new(),
                events,
                limiter,
                config,
            }),
        }
    }

    #[must_use]
    pub fn identity(&self) -> &AuthToken {
        &self.inner.identity
    }

    #[must_use]
    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn proxies(&self) -> &ProxyRegistry {
        &self.inner.proxies
    }

    pub fn register_proxy(&self, proxy: Arc<dyn Proxy>) {
        self.inner.proxies.register(proxy);
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakRpcManager {
        WeakRpcManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Requests counted as in flight.
    #[must_use]
    pub fn queued(&self) -> usize {
        *self.inner.queued.lock()
    }

    /// Requests waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    #[must_use]
    pub fn is_pending(&self, id: &MessageId) -> bool {
        self.inner.pending.lock().contains_key(id)
    }

    /// Starts executing a request.
    ///
    /// # Errors
    ///
    /// Fails without side effects when called outside a tokio runtime, when
    /// no proxy serves the destination, or when the proxy refuses to
    /// prepare the message.
    pub fn enqueue(&self, request: RpcRequest) -> Result<(), RpcError> {
        self.start(request, None)
    }

    fn start(
        &self,
        request: RpcRequest,
        responder: Option<oneshot::Sender<QueryResponse>>,
    ) -> Result<(), RpcError> {
        let handle = Handle::try_current().map_err(|_| RpcError::NoRuntime)?;
        let id = request.id();
        let tracked = request.kind().expects_response();

        self.inner.increment();
        if tracked {
            self.track(&handle, &request, responder);
        }

        let prepared = self
            .inner
            .proxies
            .get(&request.to)
            .ok_or(RpcError::UnknownPeer(request.to))
            .and_then(|proxy| {
                proxy.prepare(&request.message)?;
                Ok(proxy)
            });
        let proxy = match prepared {
            Ok(proxy) => proxy,
            Err(e) => {
                if tracked {
                    self.inner.take_pending(&id);
                }
                self.inner.decrement();
                return Err(e);
            }
        };

        debug!("enqueue {}", request);
        let inner = Arc::clone(&self.inner);
        handle.spawn(async move {
            let _permit = match &inner.limiter {
                Some(limiter) => Arc::clone(limiter).acquire_owned().await.ok(),
                None => None,
            };
            if let Err(e) = proxy.execute(request.message.clone()).await {
                warn!("{} failed: {}", request, e);
                let failure = RpcFailure::new(FailureKind::Transport, &request.message, e.to_string())
                    .with_code(e.code());
                let _ = inner.events.send(ActorEvent::FailedRpc {
                    failure,
                    recoverable: e.is_recoverable(),
                    request: Some(request),
                });
            }
            inner.decrement();
        });
        Ok(())
    }

    /// Registers a request in the pending table and arms its timer. A
    /// retried request keeps the responder it was first registered with.
    fn track(
        &self,
        handle: &Handle,
        request: &RpcRequest,
        responder: Option<oneshot::Sender<QueryResponse>>,
    ) {
        let id = request.id();
        let timeout = self.inner.timeout_for(request.kind());
        let weak = Arc::downgrade(&self.inner);
        let timer = handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&id);
            }
        });

        let mut pending = self.inner.pending.lock();
        let previous = pending.remove(&id).and_then(|mut old| {
            old.cancel_timer();
            old.responder
        });
        pending.insert(
            id,
            PendingRequest {
                request: request.clone(),
                responder: responder.or(previous),
                timer: Some(timer),
            },
        );
    }

    /// Sends a message. Failures to start are reported as a `FailedRpc`
    /// event rather than returned.
    pub fn dispatch(&self, to: ActorId, message: RpcMessage) {
        let request = RpcRequest::new(to, message);
        if let Err(e) = self.enqueue(request.clone()) {
            warn!("cannot send {}: {}", request, e);
            let failure = RpcFailure::new(FailureKind::Transport, &request.message, e.to_string())
                .with_code(e.code());
            let _ = self.inner.events.send(ActorEvent::FailedRpc {
                failure,
                request: Some(request),
                recoverable: false,
            });
        }
    }

    /// Re-sends a request after a recoverable failure.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub fn retry(&self, request: RpcRequest) -> Result<(), RpcError> {
        let request = request.retried();
        debug!("retrying {}", request);
        self.enqueue(request)
    }

    /// Drops a pending request for good, answering a waiting query with
    /// `failure`.
    pub fn abandon(&self, id: &MessageId, failure: &RpcFailure) {
        if let Some(mut entry) = self.inner.take_pending(id) {
            if let Some(responder) = entry.responder.take() {
                let _ = responder.send(Err(failure.clone()));
            }
        }
    }

    /// Asks a peer for its statistics.
    ///
    /// # Errors
    ///
    /// Same as [`enqueue`](Self::enqueue).
    pub fn query(
        &self,
        to: ActorId,
        properties: BTreeMap<String, String>,
    ) -> Result<oneshot::Receiver<QueryResponse>, RpcError> {
        let identity = self.inner.identity.clone();
        let callback = identity.guid;
        let message = RpcMessage::new(RpcRequestType::Query, identity, RpcPayload::Query(properties))
            .with_callback(callback);
        let (tx, rx) = oneshot::channel();
        self.start(RpcRequest::new(to, message), Some(tx))?;
        Ok(rx)
    }

    /// Routes a message received from a peer to this actor's queue.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the actor has stopped.
    pub fn dispatch_incoming(&self, message: RpcMessage) -> Result<(), TransportError> {
        let revived = message
            .request_id
            .and_then(|id| self.inner.take_pending(&id));

        let (request, responder) = match revived {
            Some(mut entry) => (Some(entry.request.clone()), entry.responder.take()),
            None => (None, None),
        };

        if let Some(responder) = responder {
            let answer = match &message.payload {
                RpcPayload::Failed(failure) => Err(failure.clone()),
                _ => Ok(message),
            };
            let _ = responder.send(answer);
            return Ok(());
        }

        let event = match &message.payload {
            RpcPayload::Failed(failure) if message.kind == RpcRequestType::FailedRpc => {
                ActorEvent::FailedRpc {
                    failure: failure.clone(),
                    request,
                    recoverable: false,
                }
            }
            _ => ActorEvent::IncomingRpc { message, request },
        };
        self.inner
            .events
            .send(event)
            .map_err(|_| TransportError::Closed(self.inner.identity.guid))
    }

    /// Waits until no request is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.queued() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Blocks the calling thread until no request is in flight or
    /// `timeout` passes. Returns whether the manager went idle.
    ///
    /// Must not be called from a runtime worker thread.
    #[must_use]
    pub fn await_nothing_pending(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queued = self.inner.queued.lock();
        while *queued > 0 {
            if self.inner.idle.wait_until(&mut queued, deadline).timed_out() {
                return *queued == 0;
            }
        }
        true
    }
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("identity", &self.inner.identity.name)
            .field("queued", &self.queued())
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LocalProxy;
    use async_trait::async_trait;
    use leasehold_types::ReservationId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        peer: ActorId,
        calls: AtomicUsize,
        error: Option<TransportError>,
    }

    #[async_trait]
    impl Proxy for Flaky {
        fn peer(&self) -> ActorId {
            self.peer
        }

        async fn execute(&self, _message: RpcMessage) -> Result<(), TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

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

    fn manager(name: &str) -> (RpcManager, mpsc::UnboundedReceiver<ActorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RpcManager::new(AuthToken::named(name), RpcConfig::default(), tx), rx)
    }

    fn claim(from: &str) -> RpcMessage {
        let me = AuthToken::named(from);
        let wire = leasehold_event::ReservationWire {
            reservation_id: ReservationId::new(),
            slice_id: leasehold_types::SliceId::new(),
            slice_name: "demo".into(),
            term: None,
            resources: leasehold_types::ResourceSet::new(1, "vm"),
            renewable: false,
            closed: false,
            update: leasehold_event::UpdateData::default(),
        };
        let callback = me.guid;
        RpcMessage::new(RpcRequestType::ClaimTicket, me, RpcPayload::Reservation(wire))
            .with_callback(callback)
    }

    #[test]
    fn enqueue_outside_runtime_fails_cleanly() {
        let (rpc, _rx) = manager("ctl");
        let err = rpc
            .enqueue(RpcRequest::new(ActorId::named("broker"), claim("ctl")))
            .unwrap_err();
        assert_eq!(err, RpcError::NoRuntime);
        assert_eq!(rpc.queued(), 0);
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_peer_undoes_counter_and_pending() {
        let (rpc, _rx) = manager("ctl");
        let err = rpc
            .enqueue(RpcRequest::new(ActorId::named("nobody"), claim("ctl")))
            .unwrap_err();
        assert!(matches!(err, RpcError::UnknownPeer(_)));
        assert_eq!(rpc.queued(), 0);
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn dispatch_reports_start_failures_as_events() {
        let (rpc, mut rx) = manager("ctl");
        rpc.dispatch(ActorId::named("nobody"), claim("ctl"));
        match rx.recv().await {
            Some(ActorEvent::FailedRpc { failure, recoverable, .. }) => {
                assert_eq!(failure.kind, FailureKind::Transport);
                assert_eq!(failure.code.as_deref(), Some("RPC_UNKNOWN_PEER"));
                assert!(!recoverable);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_error_becomes_failed_event() {
        let (rpc, mut rx) = manager("ctl");
        let broker = ActorId::named("broker");
        let proxy = Arc::new(Flaky {
            peer: broker,
            calls: AtomicUsize::new(0),
            error: Some(TransportError::Unreachable(broker)),
        });
        rpc.register_proxy(proxy.clone());

        rpc.enqueue(RpcRequest::new(broker, claim("ctl"))).unwrap();
        match rx.recv().await {
            Some(ActorEvent::FailedRpc { failure, request, recoverable }) => {
                assert_eq!(failure.kind, FailureKind::Transport);
                assert!(recoverable);
                let request = request.unwrap();
                rpc.retry(request).unwrap();
            }
            other => panic!("unexpected event {other:?}"),
        }
        match rx.recv().await {
            Some(ActorEvent::FailedRpc { request, .. }) => {
                assert_eq!(request.unwrap().retry_count, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        rpc.wait_idle().await;
        assert_eq!(proxy.calls.load(Ordering::SeqCst), 2);
        assert_eq!(rpc.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_times_out() {
        let (rpc, mut rx) = manager("ctl");
        let broker = ActorId::named("broker");
        rpc.register_proxy(Arc::new(Silent(broker)));

        let message = claim("ctl");
        let id = message.message_id;
        rpc.enqueue(RpcRequest::new(broker, message)).unwrap();
        rpc.wait_idle().await;
        assert!(rpc.is_pending(&id));

        tokio::time::advance(Duration::from_secs(121)).await;
        match rx.recv().await {
            Some(ActorEvent::FailedRpc { failure, request, .. }) => {
                assert_eq!(failure.kind, FailureKind::Timeout);
                assert_eq!(failure.code.as_deref(), Some("RPC_TIMEOUT"));
                assert_eq!(request.unwrap().id(), id);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!rpc.is_pending(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn response_cancels_timeout() {
        let (rpc, mut rx) = manager("ctl");
        let broker = ActorId::named("broker");
        rpc.register_proxy(Arc::new(Silent(broker)));

        let message = claim("ctl");
        rpc.enqueue(RpcRequest::new(broker, message.clone())).unwrap();
        rpc.wait_idle().await;

        let update = message.reply(
            RpcRequestType::UpdateTicket,
            AuthToken::named("broker"),
            message.payload.clone(),
        );
        rpc.dispatch_incoming(update).unwrap();
        match rx.recv().await {
            Some(ActorEvent::IncomingRpc { message: got, request }) => {
                assert_eq!(got.kind, RpcRequestType::UpdateTicket);
                assert_eq!(request.unwrap().id(), message.message_id);
            }
            other => panic!("unexpected event {other:?}"),
        }

        tokio::time::advance(Duration::from_secs(300)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn query_roundtrip_over_local_proxies() {
        let (ctl, _ctl_rx) = manager("ctl");
        let (broker, mut broker_rx) = manager("broker");
        ctl.register_proxy(Arc::new(LocalProxy::new(broker.identity().guid, &broker)));
        broker.register_proxy(Arc::new(LocalProxy::new(ctl.identity().guid, &ctl)));

        let answer = ctl.query(broker.identity().guid, BTreeMap::new()).unwrap();

        let Some(ActorEvent::IncomingRpc { message, .. }) = broker_rx.recv().await else {
            panic!("query not delivered");
        };
        let mut stats = BTreeMap::new();
        stats.insert("reservations".to_string(), "0".to_string());
        let reply = message.reply(
            RpcRequestType::QueryResult,
            broker.identity().clone(),
            RpcPayload::QueryResult(stats),
        );
        broker.dispatch(message.reply_target(), reply);

        let result = answer.await.unwrap().unwrap();
        assert_eq!(
            result.properties().unwrap().get("reservations").map(String::as_str),
            Some("0")
        );
        assert_eq!(ctl.pending_count(), 0);
    }

    #[tokio::test]
    async fn incoming_failure_becomes_failed_event() {
        let (rpc, mut rx) = manager("ctl");
        let request = claim("ctl");
        let reject = request.reject(
            AuthToken::named("broker"),
            RpcFailure::new(FailureKind::Rejected, &request, "unauthorized"),
        );
        rpc.dispatch_incoming(reject).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(ActorEvent::FailedRpc { recoverable: false, request: None, .. })
        ));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let (rpc, rx) = manager("ctl");
        drop(rx);
        assert!(matches!(
            rpc.dispatch_incoming(claim("broker")),
            Err(TransportError::Closed(_))
        ));
    }

    #[test]
    fn await_nothing_pending_when_idle() {
        let (rpc, _rx) = manager("ctl");
        assert!(rpc.await_nothing_pending(Duration::from_millis(10)));
    }
}

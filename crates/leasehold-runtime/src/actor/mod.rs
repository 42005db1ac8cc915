//! Actor event loop.
//!
//! An [`Actor`] owns one [`KernelWrapper`] and drains a single event queue:
//!
//! ```text
//!  Ticker ──────────► Tick(cycle) ──┐
//!  RpcManager ──────► IncomingRpc ──┤
//!               └───► FailedRpc ────┼──► Actor::run ──► KernelWrapper
//!  ActorHandle ─────► Command ──────┤
//!               └───► Shutdown ─────┘
//! ```
//!
//! Events are handled strictly one at a time, so the kernel is never
//! touched concurrently. Everything outside the loop talks to the actor
//! through an [`ActorHandle`].

mod clock;
mod tick;

pub use clock::ActorClock;
pub use tick::Ticker;

use crate::config::{LeaseholdConfig, RpcConfig, StoreKind};
use crate::error::KernelError;
use crate::kernel::{Kernel, KernelWrapper};
use crate::policy::{Policy, SimpleClientPolicy, UnitAuthorityPolicy, UnitBrokerPolicy};
use crate::rpc::{RpcError, RpcManager, RpcRequest};
use crate::store::{ActorStore, FileStore, MemoryStore, StoreError};
use leasehold_event::{RpcFailure, RpcMessage};
use leasehold_types::{ActorId, ActorRole, AuthToken, ErrorCode};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// A kernel operation shipped into the actor loop.
pub type Command = Box<dyn FnOnce(&mut KernelWrapper) + Send>;

/// Everything the actor loop reacts to.
pub enum ActorEvent {
    /// Start of a cycle.
    Tick(u64),
    /// A message from a peer. `request` is the local request it answers,
    /// if any.
    IncomingRpc {
        message: RpcMessage,
        request: Option<RpcRequest>,
    },
    /// A request could not be delivered or was rejected.
    FailedRpc {
        failure: RpcFailure,
        request: Option<RpcRequest>,
        recoverable: bool,
    },
    Command(Command),
    Shutdown,
}

impl std::fmt::Debug for ActorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tick(cycle) => f.debug_tuple("Tick").field(cycle).finish(),
            Self::IncomingRpc { message, request } => f
                .debug_struct("IncomingRpc")
                .field("message", message)
                .field("request", request)
                .finish(),
            Self::FailedRpc {
                failure,
                request,
                recoverable,
            } => f
                .debug_struct("FailedRpc")
                .field("failure", failure)
                .field("request", request)
                .field("recoverable", recoverable)
                .finish(),
            Self::Command(_) => f.write_str("Command(..)"),
            Self::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Actor-level errors.
///
/// | Variant | Code | Recoverable |
/// |---------|------|-------------|
/// | `Stopped` | `ACTOR_STOPPED` | No |
/// | `Kernel` | `ACTOR_KERNEL` | kernel's |
/// | `Rpc` | `ACTOR_RPC` | rpc's |
/// | `Query` | `ACTOR_QUERY` | No |
/// | `Store` | `ACTOR_STORE` | store's |
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("actor {0} has stopped")]
    Stopped(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("query failed: {0}")]
    Query(String),

    #[error("cannot open store: {0}")]
    Store(#[from] StoreError),
}

impl ErrorCode for ActorError {
    fn code(&self) -> &'static str {
        match self {
            Self::Stopped(_) => "ACTOR_STOPPED",
            Self::Kernel(_) => "ACTOR_KERNEL",
            Self::Rpc(_) => "ACTOR_RPC",
            Self::Query(_) => "ACTOR_QUERY",
            Self::Store(_) => "ACTOR_STORE",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Kernel(e) => e.is_recoverable(),
            Self::Rpc(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Stopped(_) | Self::Query(_) => false,
        }
    }
}

/// One protocol participant.
pub struct Actor {
    wrapper: KernelWrapper,
    rpc: RpcManager,
    events: mpsc::UnboundedReceiver<ActorEvent>,
    sender: mpsc::UnboundedSender<ActorEvent>,
    retry_limit: u32,
}

impl Actor {
    #[must_use]
    pub fn new(
        identity: AuthToken,
        role: ActorRole,
        clock: ActorClock,
        policy: Box<dyn Policy>,
        store: Arc<dyn ActorStore>,
        config: RpcConfig,
    ) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        let retry_limit = config.retry_limit;
        let rpc = RpcManager::new(identity, config, sender.clone());
        let kernel = Kernel::new(role, clock, policy, store, rpc.clone());
        Self {
            wrapper: KernelWrapper::new(kernel),
            rpc,
            events,
            sender,
            retry_limit,
        }
    }

    /// Builds an actor with the reference policy for its role.
    /// `authority` is where a broker's tickets are redeemed.
    ///
    /// # Errors
    ///
    /// [`ActorError::Store`] if the file store cannot be opened.
    pub fn from_config(
        config: &LeaseholdConfig,
        authority: Option<ActorId>,
    ) -> Result<Self, ActorError> {
        let identity = AuthToken::named(config.actor.name.as_str());
        let role = config.actor.role;
        let policy: Box<dyn Policy> = match role {
            ActorRole::Controller => Box::new(SimpleClientPolicy::new()),
            ActorRole::Broker => Box::new(UnitBrokerPolicy::from_config(
                identity.guid,
                &config.policy,
                authority,
            )),
            ActorRole::Authority => Box::new(UnitAuthorityPolicy::from_config(
                identity.guid,
                &config.policy,
            )),
        };
        let store: Arc<dyn ActorStore> = match config.store.kind {
            StoreKind::Memory => Arc::new(MemoryStore::new()),
            StoreKind::File => Arc::new(FileStore::new(
                config.store.resolve_data_dir(&config.actor.name),
            )?),
        };
        let clock =
            ActorClock::from_config(config.actor.beginning_of_time_ms, config.actor.cycle_millis);
        Ok(Self::new(identity, role, clock, policy, store, config.rpc.clone()))
    }

    #[must_use]
    pub fn identity(&self) -> &AuthToken {
        self.wrapper.identity()
    }

    #[must_use]
    pub fn rpc(&self) -> &RpcManager {
        &self.rpc
    }

    #[must_use]
    pub fn wrapper(&self) -> &KernelWrapper {
        &self.wrapper
    }

    pub fn wrapper_mut(&mut self) -> &mut KernelWrapper {
        &mut self.wrapper
    }

    #[must_use]
    pub fn clock(&self) -> ActorClock {
        *self.wrapper.kernel().clock()
    }

    #[must_use]
    pub fn handle(&self) -> ActorHandle {
        ActorHandle {
            identity: self.identity().clone(),
            sender: self.sender.clone(),
            rpc: self.rpc.clone(),
        }
    }

    /// Reloads persisted state. Call before [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// A store error.
    pub fn recover(&mut self) -> Result<(), ActorError> {
        self.wrapper.recover()?;
        Ok(())
    }

    /// Processes events until [`ActorHandle::shutdown`]. Peers delivering
    /// afterwards get [`TransportError::Closed`](crate::rpc::TransportError::Closed).
    pub async fn run(mut self) {
        let name = self.identity().name.clone();
        info!(actor = %name, role = %self.wrapper.role(), "actor started");
        while let Some(event) = self.events.recv().await {
            if !self.handle_event(event) {
                break;
            }
        }
        self.events.close();
        info!(actor = %name, "actor stopped");
    }

    /// Handles one event. Returns `false` when the loop should stop.
    pub fn handle_event(&mut self, event: ActorEvent) -> bool {
        match event {
            ActorEvent::Tick(cycle) => {
                if let Err(e) = self.wrapper.tick(cycle) {
                    error!(cycle, "tick failed: {}", e);
                }
            }
            ActorEvent::IncomingRpc { message, .. } => self.incoming(&message),
            ActorEvent::FailedRpc {
                failure,
                request,
                recoverable,
            } => self.failed(failure, request, recoverable),
            ActorEvent::Command(command) => command(&mut self.wrapper),
            ActorEvent::Shutdown => return false,
        }
        true
    }

    fn incoming(&mut self, message: &RpcMessage) {
        if let Err(e) = self.wrapper.process(message) {
            warn!("{} refused: {}", message, e);
            if let Some(reply) = self.wrapper.rejection(message, &e) {
                self.rpc.dispatch(message.reply_target(), reply);
            }
        }
    }

    fn failed(&mut self, failure: RpcFailure, request: Option<RpcRequest>, recoverable: bool) {
        if let Some(request) = request {
            if recoverable && request.retry_count < self.retry_limit {
                let id = request.id();
                match self.rpc.retry(request) {
                    Ok(()) => return,
                    Err(e) => {
                        warn!("retry of {} failed: {}", id, e);
                        self.rpc.abandon(&id, &failure);
                    }
                }
            } else {
                debug!("giving up on {}", request);
                self.rpc.abandon(&request.id(), &failure);
            }
        }
        if let Err(e) = self.wrapper.handle_failed_rpc(&failure) {
            error!("failure handling not committed: {}", e);
        }
    }
}

impl std::fmt::Debug for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actor")
            .field("identity", self.identity())
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

/// Cloneable way into a running [`Actor`].
#[derive(Clone, Debug)]
pub struct ActorHandle {
    identity: AuthToken,
    sender: mpsc::UnboundedSender<ActorEvent>,
    rpc: RpcManager,
}

impl ActorHandle {
    #[must_use]
    pub fn identity(&self) -> &AuthToken {
        &self.identity
    }

    #[must_use]
    pub fn rpc(&self) -> &RpcManager {
        &self.rpc
    }

    fn send(&self, event: ActorEvent) -> Result<(), ActorError> {
        self.sender
            .send(event)
            .map_err(|_| ActorError::Stopped(self.identity.name.clone()))
    }

    /// # Errors
    ///
    /// [`ActorError::Stopped`] once the loop has exited.
    pub fn tick(&self, cycle: u64) -> Result<(), ActorError> {
        self.send(ActorEvent::Tick(cycle))
    }

    /// Runs `f` inside the actor loop and returns its result.
    ///
    /// # Errors
    ///
    /// [`ActorError::Stopped`] once the loop has exited.
    pub async fn execute<T, F>(&self, f: F) -> Result<T, ActorError>
    where
        T: Send + 'static,
        F: FnOnce(&mut KernelWrapper) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(ActorEvent::Command(Box::new(move |wrapper| {
            let _ = tx.send(f(wrapper));
        })))?;
        rx.await
            .map_err(|_| ActorError::Stopped(self.identity.name.clone()))
    }

    /// Asks `peer` for its statistics.
    ///
    /// # Errors
    ///
    /// [`ActorError::Rpc`] if the query cannot be sent,
    /// [`ActorError::Query`] if it failed or timed out.
    pub async fn query(&self, peer: ActorId) -> Result<BTreeMap<String, String>, ActorError> {
        let answer = self.rpc.query(peer, BTreeMap::new())?;
        let response = answer
            .await
            .map_err(|_| ActorError::Stopped(self.identity.name.clone()))?;
        match response {
            Ok(message) => message
                .properties()
                .cloned()
                .map_err(|e| ActorError::Query(e.to_string())),
            Err(failure) => Err(ActorError::Query(failure.message)),
        }
    }

    /// Asks the loop to stop after the events already queued.
    ///
    /// # Errors
    ///
    /// [`ActorError::Stopped`] if it already has.
    pub fn shutdown(&self) -> Result<(), ActorError> {
        self.send(ActorEvent::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Proxy, TransportError};
    use async_trait::async_trait;
    use chrono::Utc;
    use leasehold_event::{RpcPayload, RpcRequestType};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn actor() -> Actor {
        Actor::new(
            AuthToken::named("ctl"),
            ActorRole::Controller,
            ActorClock::new(Utc::now(), 1_000),
            Box::new(SimpleClientPolicy::new()),
            Arc::new(MemoryStore::new()),
            RpcConfig::default(),
        )
    }

    struct Unreachable {
        peer: ActorId,
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Proxy for Unreachable {
        fn peer(&self) -> ActorId {
            self.peer
        }

        async fn execute(&self, _message: RpcMessage) -> Result<(), TransportError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Unreachable(self.peer))
        }
    }

    #[tokio::test]
    async fn execute_and_shutdown() {
        let actor = actor();
        let handle = actor.handle();
        let task = tokio::spawn(actor.run());

        let role = handle.execute(|w| w.role()).await.unwrap();
        assert_eq!(role, ActorRole::Controller);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(matches!(
            handle.execute(|w| w.role()).await,
            Err(ActorError::Stopped(_))
        ));
    }

    #[tokio::test]
    async fn recoverable_failures_are_retried_up_to_the_limit() {
        let actor = actor();
        let peer = ActorId::named("broker");
        let attempts = Arc::new(AtomicU32::new(0));
        actor.rpc().register_proxy(Arc::new(Unreachable {
            peer,
            attempts: attempts.clone(),
        }));
        let handle = actor.handle();
        let task = tokio::spawn(actor.run());

        let me = handle.identity().clone();
        let message = RpcMessage::new(
            RpcRequestType::Query,
            me.clone(),
            RpcPayload::Query(BTreeMap::new()),
        )
        .with_callback(me.guid);
        handle.rpc().dispatch(peer, message);

        let limit = RpcConfig::default().retry_limit + 1;
        tokio::time::timeout(Duration::from_secs(5), async {
            while attempts.load(Ordering::SeqCst) < limit {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), limit);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[test]
    fn error_codes() {
        leasehold_types::assert_error_codes(
            &[
                ActorError::Stopped("a".into()),
                ActorError::Query("late".into()),
            ],
            "ACTOR_",
        );
    }
}

//! Transport seam.
//!
//! A [`Proxy`] delivers messages to one peer. The RPC manager looks the
//! proxy up in its [`ProxyRegistry`], lets it `prepare` the message
//! synchronously (a rejection here undoes the enqueue), then `execute`s it
//! on a spawned task.

use super::error::TransportError;
use async_trait::async_trait;
use leasehold_event::{RpcMessage, RpcPayload, RpcRequestType};
use leasehold_types::ActorId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Proxy: Send + Sync {
    /// Actor this proxy talks to.
    fn peer(&self) -> ActorId;

    /// Builds the protocol-specific request. Runs before the request
    /// counts as queued, so errors are reported to the caller.
    fn prepare(&self, _message: &RpcMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn execute(&self, message: RpcMessage) -> Result<(), TransportError>;
}

/// Checks that a message carries the payload its type requires.
///
/// # Errors
///
/// [`TransportError::Rejected`] on a mismatch.
pub fn check_payload(message: &RpcMessage) -> Result<(), TransportError> {
    let kind = message.kind;
    let ok = match &message.payload {
        RpcPayload::Reservation(_) => {
            kind.targets_reservation() || kind == RpcRequestType::Relinquish
        }
        RpcPayload::Delegation(_) => {
            kind.targets_delegation() || kind == RpcRequestType::Relinquish
        }
        RpcPayload::Query(_) => kind == RpcRequestType::Query,
        RpcPayload::QueryResult(_) => kind == RpcRequestType::QueryResult,
        RpcPayload::Failed(_) => kind == RpcRequestType::FailedRpc,
    };
    if ok {
        Ok(())
    } else {
        Err(TransportError::Rejected(format!(
            "{} cannot carry a {} payload",
            kind,
            message.payload.name()
        )))
    }
}

/// Proxies by destination actor.
#[derive(Clone, Default)]
pub struct ProxyRegistry {
    proxies: Arc<RwLock<HashMap<ActorId, Arc<dyn Proxy>>>>,
}

impl ProxyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a proxy under its peer id, replacing any previous one.
    pub fn register(&self, proxy: Arc<dyn Proxy>) {
        self.proxies.write().insert(proxy.peer(), proxy);
    }

    pub fn unregister(&self, peer: &ActorId) -> bool {
        self.proxies.write().remove(peer).is_some()
    }

    #[must_use]
    pub fn get(&self, peer: &ActorId) -> Option<Arc<dyn Proxy>> {
        self.proxies.read().get(peer).cloned()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<ActorId> {
        let mut peers: Vec<ActorId> = self.proxies.read().keys().copied().collect();
        peers.sort();
        peers
    }
}

impl std::fmt::Debug for ProxyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistry")
            .field("peers", &self.peers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leasehold_types::AuthToken;
    use std::collections::BTreeMap;

    struct Sink(ActorId);

    #[async_trait]
    impl Proxy for Sink {
        fn peer(&self) -> ActorId {
            self.0
        }

        async fn execute(&self, _message: RpcMessage) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[test]
    fn registry_replaces_by_peer() {
        let registry = ProxyRegistry::new();
        let peer = ActorId::named("broker");
        registry.register(Arc::new(Sink(peer)));
        registry.register(Arc::new(Sink(peer)));
        assert_eq!(registry.peers(), vec![peer]);
        assert!(registry.get(&peer).is_some());
        assert!(registry.unregister(&peer));
        assert!(registry.get(&peer).is_none());
    }

    #[test]
    fn payload_must_match_type() {
        let me = AuthToken::named("ctl");
        let query = RpcMessage::new(
            RpcRequestType::Query,
            me.clone(),
            RpcPayload::Query(BTreeMap::new()),
        );
        assert!(check_payload(&query).is_ok());

        let wrong = RpcMessage::new(
            RpcRequestType::Ticket,
            me,
            RpcPayload::Query(BTreeMap::new()),
        );
        assert!(matches!(
            check_payload(&wrong),
            Err(TransportError::Rejected(_))
        ));
    }
}

//! In-process transport.

use super::error::TransportError;
use super::manager::{RpcManager, WeakRpcManager};
use super::proxy::{check_payload, Proxy};
use async_trait::async_trait;
use leasehold_event::RpcMessage;
use leasehold_types::ActorId;

/// Delivers messages straight into another actor's RPC manager in the
/// same process.
///
/// Holds the peer weakly; once the peer is dropped every delivery fails
/// with [`TransportError::Unreachable`].
pub struct LocalProxy {
    peer: ActorId,
    target: WeakRpcManager,
}

impl LocalProxy {
    #[must_use]
    pub fn new(peer: ActorId, target: &RpcManager) -> Self {
        Self {
            peer,
            target: target.downgrade(),
        }
    }
}

#[async_trait]
impl Proxy for LocalProxy {
    fn peer(&self) -> ActorId {
        self.peer
    }

    fn prepare(&self, message: &RpcMessage) -> Result<(), TransportError> {
        check_payload(message)
    }

    async fn execute(&self, message: RpcMessage) -> Result<(), TransportError> {
        let target = self
            .target
            .upgrade()
            .ok_or(TransportError::Unreachable(self.peer))?;
        target.dispatch_incoming(message)
    }
}

impl std::fmt::Debug for LocalProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProxy").field("peer", &self.peer).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use leasehold_event::{RpcPayload, RpcRequestType};
    use leasehold_types::AuthToken;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn dropped_peer_is_unreachable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = RpcManager::new(AuthToken::named("broker"), RpcConfig::default(), tx);
        let proxy = LocalProxy::new(peer.identity().guid, &peer);
        drop(peer);

        let message = RpcMessage::new(
            RpcRequestType::Query,
            AuthToken::named("ctl"),
            RpcPayload::Query(BTreeMap::new()),
        );
        assert!(matches!(
            proxy.execute(message).await,
            Err(TransportError::Unreachable(_))
        ));
    }
}

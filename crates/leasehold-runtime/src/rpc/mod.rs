//! Outbound and inbound RPC plumbing.
//!
//! Each actor owns one [`RpcManager`]. Peers are reached through
//! [`Proxy`] implementations kept in a [`ProxyRegistry`]; the crate ships
//! [`LocalProxy`] for actors living in the same process. Nothing here
//! touches kernel state: responses and failures are pushed onto the
//! actor's event queue and handled there.

mod error;
mod local;
mod manager;
mod proxy;
mod request;

pub use error::{RpcError, TransportError};
pub use local::LocalProxy;
pub use manager::{QueryResponse, RpcManager, WeakRpcManager};
pub use proxy::{check_payload, Proxy, ProxyRegistry};
pub use request::RpcRequest;

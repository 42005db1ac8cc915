//! Leasehold runtime.
//!
//! Everything an actor needs to take part in the leasing protocol:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ actor/      : Actor event loop, ActorHandle, Ticker, clock   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ kernel/     : Kernel (registries, commit), KernelWrapper     │
//! │               (validation, access checks, inbound routing)   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ reservation/: client, broker and authority state machines    │
//! │ delegation  : advertiser and holder state machine            │
//! │ slice       : groups of reservations with an access guard    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ policy/     : allocation and bidding decisions               │
//! │ rpc/        : RpcManager, proxies, retries and timeouts      │
//! │ store/      : persistence of slices and records              │
//! │ config/     : layered TOML + environment configuration       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Wire types live in `leasehold-event`; ids, terms and states in
//! `leasehold-types`; access control in `leasehold-auth`.
//!
//! # Example
//!
//! ```no_run
//! use leasehold_runtime::{Actor, LeaseholdConfig, Ticker};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LeaseholdConfig::default();
//! let mut actor = Actor::from_config(&config, None)?;
//! actor.recover()?;
//! let _ticker = Ticker::new(actor.clock(), actor.handle()).spawn();
//! actor.run().await;
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod config;
pub mod context;
pub mod delegation;
pub mod error;
pub mod kernel;
pub mod policy;
pub mod reservation;
pub mod rpc;
pub mod slice;
pub mod store;

#[cfg(test)]
mod testing;

pub use actor::{Actor, ActorClock, ActorError, ActorEvent, ActorHandle, Command, Ticker};
pub use config::{
    ConfigError, ConfigLoader, LeaseholdConfig, PolicyConfig, RpcConfig, StoreConfig, StoreKind,
};
pub use delegation::{Delegation, DelegationRecord, DelegationRole};
pub use error::{KernelError, ObjectKind};
pub use kernel::{Kernel, KernelWrapper};
pub use policy::{
    Policy, PolicyError, SimpleClientPolicy, UnitAuthorityPolicy, UnitBrokerPolicy,
};
pub use reservation::{Reservation, ReservationRecord, ReservationRole};
pub use rpc::{LocalProxy, Proxy, RpcError, RpcManager, TransportError};
pub use slice::Slice;
pub use store::{ActorStore, FileStore, MemoryStore, StoreError};

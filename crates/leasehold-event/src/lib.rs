//! RPC message model for leasehold.
//!
//! Actors exchange [`RpcMessage`]s. Each carries an [`RpcRequestType`],
//! the caller's identity, a sequence number and a payload. Reservation and
//! delegation payloads embed an [`UpdateData`] describing success or
//! failure on the sender's side.
//!
//! ```text
//! controller                    broker                     authority
//!     │ Ticket(seq=1) ───────────►│                            │
//!     │◄─────────── UpdateTicket  │                            │
//!     │ Redeem(seq=1) ─────────────────────────────────────────►│
//!     │◄──────────────────────────────────────────── UpdateLease│
//! ```

mod error;
mod message;
mod request;
mod update;

pub use error::EventError;
pub use message::{
    DelegationWire, FailureKind, ReservationWire, RpcFailure, RpcMessage, RpcPayload,
};
pub use request::RpcRequestType;
pub use update::UpdateData;

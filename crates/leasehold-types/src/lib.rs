//! Core types for leasehold.
//!
//! Leasehold is a resource-leasing control framework: controllers,
//! brokers and authorities negotiate time-bounded reservations over
//! delegated resource pools. This crate holds the plain value types
//! shared by every other crate.
//!
//! # Crate Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Value Layer                             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  leasehold-types   : ids, Term, ResourceSet, states  ◄── HERE│
//! │  leasehold-auth    : AccessGuard, Permission                 │
//! │  leasehold-event   : RpcMessage, UpdateData                  │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Runtime Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  leasehold-runtime : kernel, reservations, rpc, actor        │
//! └─────────────────────────────────────────────────────────────┘
//!                               ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Frontend Layer                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  leasehold-cli     : `leasehold` binary                      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use chrono::{Duration, Utc};
//! use leasehold_types::{compare_sequence, ReservationId, ResourceSet, SequenceComparison, Term};
//!
//! let rid = ReservationId::new();
//! let term = Term::starting_at(Utc::now(), Duration::hours(1)).unwrap();
//! let request = ResourceSet::new(10, "vm");
//!
//! assert!(rid.to_string().starts_with("rid:"));
//! assert!(term.contains(term.start()));
//! assert_eq!(request.units, 10);
//! assert_eq!(compare_sequence(1, 0, false), SequenceComparison::Greater);
//! ```

mod error;
mod id;
mod principal;
mod resource;
mod sequence;
mod state;
mod term;

pub use error::{assert_error_code, assert_error_codes, ErrorCode};
pub use id::{ActorId, DelegationId, MessageId, ReservationId, SliceId};
pub use principal::{ActorRole, AuthToken};
pub use resource::{ConcreteSet, ResourceData, ResourceSet, ResourceType};
pub use sequence::{compare as compare_sequence, SequenceComparison};
pub use state::{DelegationState, ReservationPendingState, ReservationState, SliceKind};
pub use term::{Term, TermError};

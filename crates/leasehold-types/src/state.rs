//! Lifecycle states.
//!
//! Reservations move along two orthogonal axes: a primary
//! [`ReservationState`] and a [`ReservationPendingState`] describing the
//! operation currently in flight. Delegations have a single axis.
//!
//! ```text
//!             ticket            redeem
//!  Nascent ----------> Ticketed --------> Active <--> ActiveTicketed
//!     |                   |                 |
//!     +-------------------+------ close ----+--> CloseWait --> Closed
//!     |
//!     +-- any failure --> Failed
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary reservation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReservationState {
    #[default]
    Nascent,
    Ticketed,
    Active,
    ActiveTicketed,
    Closed,
    CloseWait,
    Failed,
    Unknown,
}

impl ReservationState {
    /// Closed and Failed are terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }

    /// Whether the reservation currently holds a lease.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::ActiveTicketed)
    }
}

impl fmt::Display for ReservationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Operation in flight for a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReservationPendingState {
    #[default]
    None,
    Ticketing,
    Redeeming,
    ExtendingTicket,
    ExtendingLease,
    Priming,
    Closing,
    Probing,
    ModifyingLease,
    AbsorbUpdate,
    SendUpdate,
    Unknown,
}

impl ReservationPendingState {
    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::None
    }
}

impl fmt::Display for ReservationPendingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Delegation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DelegationState {
    #[default]
    Nascent,
    Delegated,
    Closed,
    Reclaimed,
    Failed,
}

impl DelegationState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What a slice groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SliceKind {
    /// Delegated inventory held by a broker or advertised by an authority.
    Inventory,
    /// Reservations owned by a local controller, or by a remote client on an authority.
    #[default]
    Client,
    /// Reservations a broker holds on behalf of a remote client.
    BrokerClient,
}

//! RPC request types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an RPC message.
///
/// | Kind | Direction | Carries |
/// |------|-----------|---------|
/// | `Ticket`, `ClaimTicket`, `ExtendTicket`, `Relinquish` | controller → broker | reservation |
/// | `Redeem`, `ExtendLease`, `ModifyLease`, `Close` | controller → authority | reservation |
/// | `UpdateTicket` | broker → controller | reservation |
/// | `UpdateLease` | authority → controller | reservation |
/// | `ClaimDelegation`, `ReclaimDelegation` | broker → authority | delegation |
/// | `UpdateDelegation` | authority → broker | delegation |
/// | `Relinquish` | either way | delegation |
/// | `Query` / `QueryResult` | any | properties |
/// | `FailedRpc` | any | failure notice |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcRequestType {
    ClaimDelegation,
    ReclaimDelegation,
    Ticket,
    ClaimTicket,
    ExtendTicket,
    Relinquish,
    Redeem,
    ExtendLease,
    ModifyLease,
    Close,
    UpdateTicket,
    UpdateLease,
    UpdateDelegation,
    Query,
    QueryResult,
    FailedRpc,
}

impl RpcRequestType {
    /// Requests that register in the pending table and time out.
    #[must_use]
    pub fn expects_response(self) -> bool {
        matches!(self, Self::ClaimTicket | Self::ClaimDelegation | Self::Query)
    }

    /// Peer-to-peer updates, checked against UPDATE rather than RESERVE.
    #[must_use]
    pub fn is_update(self) -> bool {
        matches!(
            self,
            Self::UpdateTicket | Self::UpdateLease | Self::UpdateDelegation
        )
    }

    /// Whether the message's payload is a reservation.
    #[must_use]
    pub fn targets_reservation(self) -> bool {
        matches!(
            self,
            Self::Ticket
                | Self::ClaimTicket
                | Self::ExtendTicket
                | Self::Redeem
                | Self::ExtendLease
                | Self::ModifyLease
                | Self::Close
                | Self::UpdateTicket
                | Self::UpdateLease
        )
    }

    /// Whether the message's payload is a delegation.
    #[must_use]
    pub fn targets_delegation(self) -> bool {
        matches!(
            self,
            Self::ClaimDelegation | Self::ReclaimDelegation | Self::UpdateDelegation
        )
    }

    /// Protocol operations numbered by the sender, starting at 1.
    #[must_use]
    pub fn is_sequenced(self) -> bool {
        !matches!(self, Self::Query | Self::QueryResult | Self::FailedRpc)
    }
}

impl fmt::Display for RpcRequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

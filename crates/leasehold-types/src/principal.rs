//! Actor identity.
//!
//! An [`AuthToken`] names who is acting. It travels on every RPC message
//! as the caller and is what the slice access guards check against.

use crate::ActorId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of an actor or user issuing a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken {
    /// Human readable name.
    pub name: String,
    /// Stable identifier.
    pub guid: ActorId,
}

impl AuthToken {
    /// Creates a token whose guid is derived from the name.
    ///
    /// # Example
    ///
    /// ```
    /// use leasehold_types::{ActorId, AuthToken};
    ///
    /// let token = AuthToken::named("controller");
    /// assert_eq!(token.guid, ActorId::named("controller"));
    /// ```
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let guid = ActorId::named(&name);
        Self { name, guid }
    }

    /// Creates a token with an explicit guid.
    #[must_use]
    pub fn new(name: impl Into<String>, guid: ActorId) -> Self {
        Self {
            name: name.into(),
            guid,
        }
    }
}

impl fmt::Display for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.guid)
    }
}

/// Role an actor plays in the leasing protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    /// Orchestrator / controller: requests tickets and redeems them.
    #[default]
    Controller,
    /// Ticket issuer holding delegated inventory.
    Broker,
    /// Site authority issuing concrete leases.
    Authority,
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Controller => "controller",
            Self::Broker => "broker",
            Self::Authority => "authority",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ActorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "controller" | "orchestrator" | "client" => Ok(Self::Controller),
            "broker" => Ok(Self::Broker),
            "authority" | "site" => Ok(Self::Authority),
            other => Err(format!("unknown actor role: {other}")),
        }
    }
}

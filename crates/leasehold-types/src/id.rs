//! Identifier types.
//!
//! Every identifier is a UUID newtype so that ids can cross actor
//! boundaries and survive persistence without coordination. Each type
//! renders with a short prefix (`actor:`, `slice:`, `rid:`, `del:`,
//! `msg:`) to keep log lines unambiguous.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{uuid, Uuid};

/// Namespace for deterministic (v5) actor ids derived from names.
const LEASEHOLD_NAMESPACE: Uuid = uuid!("5b0f1e7a-3c52-4c8e-9d1b-6a2f0c4e8b17");

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Creates a new random identifier (UUID v4).
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            /// Parses either the bare UUID or the prefixed display form.
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = s
                    .strip_prefix(concat!($prefix, ":"))
                    .unwrap_or(s);
                Uuid::parse_str(raw).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of an actor (controller, broker or authority).
    ///
    /// Actor ids are usually derived from the actor name with
    /// [`ActorId::named`] so that restarted actors keep their identity.
    ActorId,
    "actor"
);

uuid_id!(
    /// Identifier of a slice, the grouping unit for reservations and delegations.
    SliceId,
    "slice"
);

uuid_id!(
    /// Identifier of a reservation. Immutable once assigned.
    ReservationId,
    "rid"
);

uuid_id!(
    /// Identifier of a delegation.
    DelegationId,
    "del"
);

uuid_id!(
    /// Identifier of an RPC message. Responses refer to the request's id.
    MessageId,
    "msg"
);

impl ActorId {
    /// Creates a deterministic actor id (UUID v5) from an actor name.
    ///
    /// # Example
    ///
    /// ```
    /// use leasehold_types::ActorId;
    ///
    /// assert_eq!(ActorId::named("site-a"), ActorId::named("site-a"));
    /// assert_ne!(ActorId::named("site-a"), ActorId::named("broker"));
    /// ```
    #[must_use]
    pub fn named(name: &str) -> Self {
        Self(Uuid::new_v5(&LEASEHOLD_NAMESPACE, name.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn random_ids_are_unique() {
        assert_ne!(ReservationId::new(), ReservationId::new());
        assert_ne!(SliceId::new(), SliceId::new());
    }

    #[test]
    fn display_uses_prefix() {
        let rid = ReservationId::new();
        assert!(rid.to_string().starts_with("rid:"));
        assert!(DelegationId::new().to_string().starts_with("del:"));
        assert!(ActorId::named("x").to_string().starts_with("actor:"));
        assert!(MessageId::new().to_string().starts_with("msg:"));
    }

    #[test]
    fn parse_accepts_prefixed_and_bare() {
        let rid = ReservationId::new();
        assert_eq!(ReservationId::from_str(&rid.to_string()).unwrap(), rid);
        assert_eq!(
            ReservationId::from_str(&rid.uuid().to_string()).unwrap(),
            rid
        );
        assert!(SliceId::from_str("slice:not-a-uuid").is_err());
    }

    #[test]
    fn serializes_as_plain_uuid() {
        let id = SliceId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.uuid()));
        let back: SliceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}

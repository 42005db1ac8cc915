//! Slice permissions.
//!
//! ```
//! use leasehold_auth::Permission;
//!
//! let peer = Permission::UPDATE | Permission::QUERY;
//! assert!(peer.contains(Permission::UPDATE));
//! assert!(!peer.contains(Permission::RESERVE));
//! assert_eq!(Permission::parse("reserve"), Some(Permission::RESERVE));
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Operations a principal may perform on a slice.
    ///
    /// | Permission | Operations |
    /// |------------|------------|
    /// | [`RESERVE`](Self::RESERVE) | ticket, redeem, extend, modify, close, relinquish, claim |
    /// | [`UPDATE`](Self::UPDATE) | update ticket / lease / delegation, failure notices |
    /// | [`QUERY`](Self::QUERY) | query |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Permission: u8 {
        const RESERVE = 0b0000_0001;
        const UPDATE  = 0b0000_0010;
        const QUERY   = 0b0000_0100;
    }
}

impl Permission {
    /// Every permission; what the slice owner holds.
    pub const OWNER: Self = Self::RESERVE.union(Self::UPDATE).union(Self::QUERY);

    /// Parses a permission name (case-insensitive).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "RESERVE" => Some(Self::RESERVE),
            "UPDATE" => Some(Self::UPDATE),
            "QUERY" => Some(Self::QUERY),
            "OWNER" | "ALL" => Some(Self::OWNER),
            _ => None,
        }
    }

    /// Names of the set flags.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        f.write_str(&self.names().join("|"))
    }
}

//! Per-slice access guard.
//!
//! Every slice carries an [`AccessGuard`]. The kernel wrapper consults it
//! before forwarding any request:
//!
//! ```text
//! caller ──► check_reserve / check_update ──► kernel
//!               │
//!               └── AccessDenied ──► rejected, no state change
//! ```
//!
//! The owner implicitly holds [`Permission::OWNER`]. Other principals
//! (usually protocol peers) get explicit grants.

use crate::{AccessDenied, Permission};
use leasehold_types::{ActorId, AuthToken};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Owner plus explicit per-principal grants.
///
/// # Example
///
/// ```
/// use leasehold_auth::{AccessGuard, Permission};
/// use leasehold_types::AuthToken;
///
/// let owner = AuthToken::named("controller");
/// let broker = AuthToken::named("broker");
///
/// let mut guard = AccessGuard::new(owner.clone());
/// assert!(guard.check_reserve(&owner).is_ok());
/// assert!(guard.check_update(&broker).is_err());
///
/// guard.grant(broker.guid, Permission::UPDATE);
/// assert!(guard.check_update(&broker).is_ok());
/// assert!(guard.check_reserve(&broker).is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGuard {
    owner: AuthToken,
    #[serde(default)]
    grants: BTreeMap<ActorId, Permission>,
}

impl AccessGuard {
    #[must_use]
    pub fn new(owner: AuthToken) -> Self {
        Self {
            owner,
            grants: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn owner(&self) -> &AuthToken {
        &self.owner
    }

    /// Adds `permission` to whatever `principal` already holds.
    pub fn grant(&mut self, principal: ActorId, permission: Permission) {
        *self.grants.entry(principal).or_insert_with(Permission::empty) |= permission;
    }

    /// Removes `permission` from `principal`.
    pub fn revoke(&mut self, principal: ActorId, permission: Permission) {
        if let Some(held) = self.grants.get_mut(&principal) {
            held.remove(permission);
            if held.is_empty() {
                self.grants.remove(&principal);
            }
        }
    }

    /// Effective permissions of `principal`.
    #[must_use]
    pub fn permissions_of(&self, principal: &ActorId) -> Permission {
        if *principal == self.owner.guid {
            return Permission::OWNER;
        }
        self.grants
            .get(principal)
            .copied()
            .unwrap_or_else(Permission::empty)
    }

    /// Checks that `requester` may reserve, extend or close in this slice.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] if the requester lacks [`Permission::RESERVE`].
    pub fn check_reserve(&self, requester: &AuthToken) -> Result<(), AccessDenied> {
        self.check(requester, Permission::RESERVE)
    }

    /// Checks that `requester` may push updates into this slice.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] if the requester lacks [`Permission::UPDATE`].
    pub fn check_update(&self, requester: &AuthToken) -> Result<(), AccessDenied> {
        self.check(requester, Permission::UPDATE)
    }

    /// Checks that `requester` may query this slice.
    ///
    /// # Errors
    ///
    /// Returns [`AccessDenied`] if the requester lacks [`Permission::QUERY`].
    pub fn check_query(&self, requester: &AuthToken) -> Result<(), AccessDenied> {
        self.check(requester, Permission::QUERY)
    }

    fn check(&self, requester: &AuthToken, required: Permission) -> Result<(), AccessDenied> {
        if requester.name == self.owner.name && requester.guid != self.owner.guid {
            return Err(AccessDenied::IdentityMismatch {
                name: requester.name.clone(),
                expected: self.owner.guid,
                actual: requester.guid,
            });
        }
        if self.permissions_of(&requester.guid).contains(required) {
            Ok(())
        } else {
            Err(AccessDenied::NotPermitted {
                requester: requester.name.clone(),
                owner: self.owner.name.clone(),
                required,
            })
        }
    }
}

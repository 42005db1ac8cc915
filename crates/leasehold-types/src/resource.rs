//! Resource sets.
//!
//! A [`ResourceSet`] describes "how many units of which type". Once an
//! allocation completes it also carries a [`ConcreteSet`], the backing
//! object produced by the issuing actor:
//!
//! | Issuer | Concrete set |
//! |--------|--------------|
//! | Broker | [`ConcreteSet::Ticket`] (claim on delegated inventory) |
//! | Authority | [`ConcreteSet::Units`] (assigned unit names) |

use crate::{ActorId, DelegationId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resource type tag, e.g. `"vm"` or `"vlan"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceType(String);

impl ResourceType {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Free-form properties attached to a resource set.
///
/// The four maps mirror who wrote them: the local actor, the requester,
/// the issuer and configuration handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceData {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub request: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, String>,
}

impl ResourceData {
    /// Overlays every map of `other` onto `self`.
    pub fn merge(&mut self, other: &ResourceData) {
        self.local
            .extend(other.local.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.request
            .extend(other.request.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.resource
            .extend(other.resource.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.config
            .extend(other.config.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
}

/// Backing object of an allocated resource set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConcreteSet {
    /// Broker-issued ticket.
    Ticket {
        issuer: ActorId,
        units: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delegation: Option<DelegationId>,
    },
    /// Authority-assigned units.
    Units { assigned: Vec<String> },
}

impl ConcreteSet {
    /// Number of units backed by this set.
    #[must_use]
    pub fn units(&self) -> u32 {
        match self {
            Self::Ticket { units, .. } => *units,
            Self::Units { assigned } => u32::try_from(assigned.len()).unwrap_or(u32::MAX),
        }
    }
}

/// Quantity of a resource type, optionally backed by a concrete set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSet {
    pub units: u32,
    pub rtype: ResourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concrete: Option<ConcreteSet>,
    #[serde(default)]
    pub data: ResourceData,
}

impl ResourceSet {
    /// Creates an abstract (not yet allocated) resource set.
    ///
    /// # Example
    ///
    /// ```
    /// use leasehold_types::ResourceSet;
    ///
    /// let rs = ResourceSet::new(4, "vm");
    /// assert_eq!(rs.units, 4);
    /// assert!(!rs.is_concrete());
    /// ```
    #[must_use]
    pub fn new(units: u32, rtype: impl Into<ResourceType>) -> Self {
        Self {
            units,
            rtype: rtype.into(),
            concrete: None,
            data: ResourceData::default(),
        }
    }

    /// Attaches a concrete backing set.
    #[must_use]
    pub fn with_concrete(mut self, concrete: ConcreteSet) -> Self {
        self.concrete = Some(concrete);
        self
    }

    #[must_use]
    pub fn is_concrete(&self) -> bool {
        self.concrete.is_some()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units == 0
    }

    /// Replaces units and backing with those of `incoming`, merging properties.
    ///
    /// Resource type mismatches are rejected by returning `false`.
    pub fn absorb(&mut self, incoming: &ResourceSet) -> bool {
        if incoming.rtype != self.rtype {
            return false;
        }
        self.units = incoming.units;
        self.concrete.clone_from(&incoming.concrete);
        self.data.merge(&incoming.data);
        true
    }
}

impl From<String> for ResourceType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ResourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.units, self.rtype)?;
        if self.concrete.is_some() {
            f.write_str("*")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_copies_units_and_backing() {
        let mut mine = ResourceSet::new(2, "vm");
        mine.data.local.insert("owner".into(), "me".into());

        let mut theirs = ResourceSet::new(5, "vm").with_concrete(ConcreteSet::Ticket {
            issuer: ActorId::named("broker"),
            units: 5,
            delegation: None,
        });
        theirs.data.resource.insert("site".into(), "a".into());

        assert!(mine.absorb(&theirs));
        assert_eq!(mine.units, 5);
        assert_eq!(mine.concrete.as_ref().map(ConcreteSet::units), Some(5));
        assert_eq!(mine.data.local.get("owner").map(String::as_str), Some("me"));
        assert_eq!(mine.data.resource.get("site").map(String::as_str), Some("a"));
    }

    #[test]
    fn absorb_rejects_type_mismatch() {
        let mut mine = ResourceSet::new(2, "vm");
        assert!(!mine.absorb(&ResourceSet::new(2, "vlan")));
        assert_eq!(mine.rtype.as_str(), "vm");
    }

    #[test]
    fn unit_set_counts_assigned() {
        let units = ConcreteSet::Units {
            assigned: vec!["vm-0".into(), "vm-1".into()],
        };
        assert_eq!(units.units(), 2);
    }

    #[test]
    fn concrete_serializes_with_kind_tag() {
        let rs = ResourceSet::new(1, "vm").with_concrete(ConcreteSet::Units {
            assigned: vec!["vm-0".into()],
        });
        let json = serde_json::to_value(&rs).unwrap();
        assert_eq!(json["concrete"]["kind"], "units");
        assert!(json["data"].as_object().unwrap().is_empty());
    }

    #[test]
    fn display_marks_concrete_sets() {
        assert_eq!(ResourceSet::new(3, "vm").to_string(), "3xvm");
        let rs = ResourceSet::new(1, "vm").with_concrete(ConcreteSet::Units { assigned: vec![] });
        assert_eq!(rs.to_string(), "1xvm*");
    }
}

//! Configuration types.
//!
//! All types implement [`Default`] for compile-time fallback values.

use leasehold_types::ActorRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Main configuration structure, the result of merging every layer.
///
/// # Example
///
/// ```
/// use leasehold_runtime::config::LeaseholdConfig;
///
/// let config = LeaseholdConfig::default();
/// assert!(!config.debug);
/// assert_eq!(config.rpc.claim_timeout_secs, 120);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeaseholdConfig {
    /// Verbose logging and diagnostics.
    pub debug: bool,
    pub actor: ActorConfig,
    pub rpc: RpcConfig,
    pub store: StoreConfig,
    pub policy: PolicyConfig,
}

impl LeaseholdConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes to TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Deserializes from TOML string.
    ///
    /// # Errors
    ///
    /// Returns error if deserialization fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(toml_str)
    }

    /// Merges another config into this one.
    ///
    /// Values from `other` override values in `self` only if they
    /// differ from the default.
    pub fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.debug != default.debug {
            self.debug = other.debug;
        }

        self.actor.merge(&other.actor);
        self.rpc.merge(&other.rpc);
        self.store.merge(&other.store);
        self.policy.merge(&other.policy);
    }
}

/// Identity and clock of the local actor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActorConfig {
    pub name: String,
    pub role: ActorRole,

    /// Length of one cycle in milliseconds.
    pub cycle_millis: u64,

    /// Wall-clock origin of cycle 0, as Unix milliseconds. `None` means
    /// "when the actor starts".
    pub beginning_of_time_ms: Option<i64>,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            name: "leasehold".into(),
            role: ActorRole::Controller,
            cycle_millis: 1_000,
            beginning_of_time_ms: None,
        }
    }
}

impl ActorConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.name != default.name {
            self.name.clone_from(&other.name);
        }
        if other.role != default.role {
            self.role = other.role;
        }
        if other.cycle_millis != default.cycle_millis {
            self.cycle_millis = other.cycle_millis;
        }
        if other.beginning_of_time_ms.is_some() {
            self.beginning_of_time_ms = other.beginning_of_time_ms;
        }
    }
}

/// Outbound RPC behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RpcConfig {
    pub claim_timeout_secs: u64,
    pub query_timeout_secs: u64,

    /// Retries for recoverable transport failures before the failure is
    /// handed to the kernel.
    pub retry_limit: u32,

    /// Cap on concurrently executing outbound requests. Unbounded when unset.
    pub max_in_flight: Option<usize>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            claim_timeout_secs: 120,
            query_timeout_secs: 120,
            retry_limit: 3,
            max_in_flight: None,
        }
    }
}

impl RpcConfig {
    fn merge(&mut self, other: &Self) {
        let default = Self::default();

        if other.claim_timeout_secs != default.claim_timeout_secs {
            self.claim_timeout_secs = other.claim_timeout_secs;
        }
        if other.query_timeout_secs != default.query_timeout_secs {
            self.query_timeout_secs = other.query_timeout_secs;
        }
        if other.retry_limit != default.retry_limit {
            self.retry_limit = other.retry_limit;
        }
        if other.max_in_flight.is_some() {
            self.max_in_flight = other.max_in_flight;
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,

    /// Root of the file store. Defaults to `~/.leasehold/data/<actor name>`.
    pub data_dir: Option<PathBuf>,
}

impl StoreConfig {
    fn merge(&mut self, other: &Self) {
        if other.kind != StoreKind::default() {
            self.kind = other.kind;
        }
        if other.data_dir.is_some() {
            self.data_dir.clone_from(&other.data_dir);
        }
    }

    /// Resolved data directory for the named actor.
    #[must_use]
    pub fn resolve_data_dir(&self, actor_name: &str) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| super::default_config_dir().join("data").join(actor_name))
    }
}

/// Settings for the reference policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Units per resource type offered by an authority.
    pub inventory: BTreeMap<String, u32>,

    /// Broker holds every bind for explicit approval.
    pub manual_approval: bool,
}

impl PolicyConfig {
    fn merge(&mut self, other: &Self) {
        for (rtype, units) in &other.inventory {
            self.inventory.insert(rtype.clone(), *units);
        }
        if other.manual_approval {
            self.manual_approval = true;
        }
    }
}

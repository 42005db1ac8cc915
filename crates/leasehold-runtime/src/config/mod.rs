//! Configuration management with hierarchical layering.
//!
//! # Architecture
//!
//! ```text
//! Priority (highest to lowest):
//!
//! ┌──────────────────────────────────────────────┐
//! │  1. Environment Variables (LEASEHOLD_*)      │  Runtime override
//! ├──────────────────────────────────────────────┤
//! │  2. Project Config (.leasehold/config.toml)  │  Project-specific
//! ├──────────────────────────────────────────────┤
//! │  3. Global Config (~/.leasehold/config.toml) │  User defaults
//! ├──────────────────────────────────────────────┤
//! │  4. Default Values (compile-time)            │  Fallback
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Config Field | Type |
//! |----------|--------------|------|
//! | `LEASEHOLD_DEBUG` | `debug` | bool |
//! | `LEASEHOLD_CYCLE_MILLIS` | `actor.cycle_millis` | u64 |
//! | `LEASEHOLD_DATA_DIR` | `store.data_dir` | PathBuf |
//! | `LEASEHOLD_RETRY_LIMIT` | `rpc.retry_limit` | u32 |
//! | `LEASEHOLD_MAX_IN_FLIGHT` | `rpc.max_in_flight` | usize |
//!
//! # Example Configuration
//!
//! ```toml
//! # ~/.leasehold/config.toml
//! debug = false
//!
//! [actor]
//! name = "site-a"
//! role = "authority"
//! cycle_millis = 1000
//!
//! [rpc]
//! claim_timeout_secs = 120
//! retry_limit = 3
//!
//! [store]
//! kind = "file"
//! data_dir = "~/.leasehold/data"
//!
//! [policy]
//! manual_approval = false
//!
//! [policy.inventory]
//! vm = 10
//! ```

mod error;
mod loader;
mod resolver;
mod types;

pub use error::ConfigError;
pub use loader::{save_global_config, ConfigLoader};
pub use resolver::{ConfigResolver, NoOpResolver};
pub use types::{ActorConfig, LeaseholdConfig, PolicyConfig, RpcConfig, StoreConfig, StoreKind};

/// Default global config directory.
pub fn default_config_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".leasehold")
}

/// Default global config file path.
pub fn default_config_path() -> std::path::PathBuf {
    default_config_dir().join("config.toml")
}

/// Project config directory name.
pub const PROJECT_CONFIG_DIR: &str = ".leasehold";

/// Project config file name.
pub const PROJECT_CONFIG_FILE: &str = "config.toml";

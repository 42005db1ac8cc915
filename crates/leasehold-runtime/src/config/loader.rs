//! Configuration loader with hierarchical merging.
//!
//! # Load Order
//!
//! 1. Default values (compile-time)
//! 2. Global config (`~/.leasehold/config.toml`)
//! 3. Project config (`.leasehold/config.toml`)
//! 4. Environment variables (`LEASEHOLD_*`)
//!
//! Each layer overrides the previous.

use super::{
    default_config_path, ConfigError, LeaseholdConfig, PROJECT_CONFIG_DIR, PROJECT_CONFIG_FILE,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reads `var` and parses it with `parse`, leaving `field` alone when unset.
fn env_override<T>(
    field: &mut T,
    var: &'static str,
    expected: &'static str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Result<(), ConfigError> {
    if let Ok(raw) = std::env::var(var) {
        *field = parse(raw.trim()).ok_or_else(|| ConfigError::invalid_env_var(var, expected))?;
    }
    Ok(())
}

fn number<T: std::str::FromStr>(raw: &str) -> Option<T> {
    raw.parse().ok()
}

/// Configuration loader with builder pattern.
///
/// # Example
///
/// ```no_run
/// use leasehold_runtime::config::ConfigLoader;
///
/// let config = ConfigLoader::new()
///     .with_project_root("/path/to/project")
///     .skip_env_vars()
///     .load()?;
/// # Ok::<(), leasehold_runtime::config::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    global_config_path: Option<PathBuf>,
    project_root: Option<PathBuf>,
    skip_env: bool,
    skip_global: bool,
    skip_project: bool,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a custom global config path.
    #[must_use]
    pub fn with_global_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_config_path = Some(path.into());
        self
    }

    /// Project config will be loaded from `<project_root>/.leasehold/config.toml`.
    #[must_use]
    pub fn with_project_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_root = Some(path.into());
        self
    }

    #[must_use]
    pub fn skip_env_vars(mut self) -> Self {
        self.skip_env = true;
        self
    }

    #[must_use]
    pub fn skip_global_config(mut self) -> Self {
        self.skip_global = true;
        self
    }

    #[must_use]
    pub fn skip_project_config(mut self) -> Self {
        self.skip_project = true;
        self
    }

    /// File layers in merge order, each with a label for logging.
    fn file_layers(&self) -> Vec<(&'static str, PathBuf)> {
        let mut layers = Vec::with_capacity(2);
        if !self.skip_global {
            let path = self
                .global_config_path
                .clone()
                .unwrap_or_else(default_config_path);
            layers.push(("global", path));
        }
        if let (false, Some(root)) = (self.skip_project, &self.project_root) {
            layers.push((
                "project",
                root.join(PROJECT_CONFIG_DIR).join(PROJECT_CONFIG_FILE),
            ));
        }
        layers
    }

    /// Loads and merges configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a config file exists but cannot be read or
    /// parsed, or an environment variable holds an unparsable value.
    /// Missing files are skipped.
    pub fn load(&self) -> Result<LeaseholdConfig, ConfigError> {
        let mut config = LeaseholdConfig::default();
        for (layer, path) in self.file_layers() {
            if let Some(found) = read_layer(&path)? {
                debug!(layer, path = %path.display(), "config layer merged");
                config.merge(&found);
            }
        }
        if !self.skip_env {
            apply_env(&mut config)?;
        }
        Ok(config)
    }
}

fn read_layer(path: &Path) -> Result<Option<LeaseholdConfig>, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::read_file(path, e)),
    };
    LeaseholdConfig::from_toml(&content)
        .map(Some)
        .map_err(|e| ConfigError::parse_toml(path, e))
}

fn apply_env(config: &mut LeaseholdConfig) -> Result<(), ConfigError> {
    env_override(&mut config.debug, "LEASEHOLD_DEBUG", "expected bool", parse_bool)?;
    env_override(
        &mut config.actor.cycle_millis,
        "LEASEHOLD_CYCLE_MILLIS",
        "expected integer",
        number,
    )?;
    env_override(
        &mut config.rpc.retry_limit,
        "LEASEHOLD_RETRY_LIMIT",
        "expected integer",
        number,
    )?;
    // 0 lifts the bound.
    env_override(
        &mut config.rpc.max_in_flight,
        "LEASEHOLD_MAX_IN_FLIGHT",
        "expected integer",
        |raw| number::<usize>(raw).map(|n| (n > 0).then_some(n)),
    )?;
    env_override(
        &mut config.store.data_dir,
        "LEASEHOLD_DATA_DIR",
        "expected path",
        |raw| Some(Some(PathBuf::from(raw))),
    )?;
    Ok(())
}

/// Accepts "true", "false", "1", "0", "yes", "no", "on", "off" (case-insensitive).
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Saves a config to the global config file, creating the directory if needed.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be written.
pub fn save_global_config(config: &LeaseholdConfig) -> Result<(), ConfigError> {
    save_config_to(config, &default_config_path())
}

pub(crate) fn save_config_to(config: &LeaseholdConfig, path: &Path) -> Result<(), ConfigError> {
    let toml = config.to_toml()?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::create_dir(dir, e))?;
    }
    std::fs::write(path, toml).map_err(|e| ConfigError::write_file(path, e))
}

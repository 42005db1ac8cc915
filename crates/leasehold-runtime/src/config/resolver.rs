//! Runtime overrides applied after loading.
//!
//! ```text
//! ConfigLoader.load()  →  LeaseholdConfig (base)
//!                              │
//!                     ConfigResolver.apply()
//!                              │
//!                              ▼
//!                     LeaseholdConfig (final)
//! ```
//!
//! The CLI implements this for its command-line flags.

use super::LeaseholdConfig;

/// Applies a set of overrides to a loaded configuration.
///
/// Implementations should only touch fields they were explicitly given.
pub trait ConfigResolver {
    fn apply(&self, config: &mut LeaseholdConfig);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpResolver;

impl ConfigResolver for NoOpResolver {
    fn apply(&self, _config: &mut LeaseholdConfig) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_resolver_does_nothing() {
        let mut config = LeaseholdConfig::default();
        let original = config.clone();
        NoOpResolver.apply(&mut config);
        assert_eq!(config, original);
    }

    #[test]
    fn custom_resolver_overrides_cycle() {
        struct Fast;

        impl ConfigResolver for Fast {
            fn apply(&self, config: &mut LeaseholdConfig) {
                config.actor.cycle_millis = 10;
            }
        }

        let mut config = LeaseholdConfig::default();
        Fast.apply(&mut config);
        assert_eq!(config.actor.cycle_millis, 10);
    }
}

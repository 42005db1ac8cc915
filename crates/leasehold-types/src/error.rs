//! Unified error code interface.
//!
//! Every error enum in the leasehold crates implements [`ErrorCode`] so
//! that the actor loop can decide whether to retry and so that failures
//! crossing the wire carry a stable, machine-readable code.
//!
//! # Code Prefixes
//!
//! | Prefix | Crate / Module |
//! |--------|----------------|
//! | `TERM_` | `leasehold-types::term` |
//! | `AUTH_` | `leasehold-auth` |
//! | `EVENT_` | `leasehold-event` |
//! | `KERNEL_` | `leasehold-runtime::kernel` |
//! | `POLICY_` | `leasehold-runtime::policy` |
//! | `RPC_` | `leasehold-runtime::rpc` |
//! | `STORE_` | `leasehold-runtime::store` |
//! | `ACTOR_` | `leasehold-runtime::actor` |
//!
//! # Example
//!
//! ```
//! use leasehold_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum LinkError {
//!     Down,
//!     Refused,
//! }
//!
//! impl ErrorCode for LinkError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::Down => "LINK_DOWN",
//!             Self::Refused => "LINK_REFUSED",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Down)
//!     }
//! }
//!
//! assert_eq!(LinkError::Down.code(), "LINK_DOWN");
//! assert!(!LinkError::Refused.is_recoverable());
//! ```

/// Machine-readable error classification.
///
/// # Code Format
///
/// - **UPPER_SNAKE_CASE**, prefixed with the owning domain (`KERNEL_`, `RPC_`, ...)
/// - **Stable**: once published a code is part of the wire contract
///
/// # Recoverability
///
/// Recoverable errors are transient: retrying the same operation later
/// may succeed (an unreachable peer, a timeout). Validation and
/// authorization failures are never recoverable.
pub trait ErrorCode {
    /// Returns the machine-readable error code.
    fn code(&self) -> &'static str;

    /// Returns whether retrying the failed operation may succeed.
    fn is_recoverable(&self) -> bool;
}

/// Asserts that an error code is non-empty, prefixed and UPPER_SNAKE_CASE.
///
/// # Panics
///
/// Panics with a descriptive message if any check fails.
///
/// # Example
///
/// ```
/// use leasehold_types::{assert_error_code, ErrorCode};
///
/// struct Stale;
///
/// impl ErrorCode for Stale {
///     fn code(&self) -> &'static str { "SEQ_STALE" }
///     fn is_recoverable(&self) -> bool { false }
/// }
///
/// assert_error_code(&Stale, "SEQ_");
/// ```
pub fn assert_error_code<E: ErrorCode>(err: &E, expected_prefix: &str) {
    let code = err.code();

    assert!(!code.is_empty(), "Error code must not be empty");
    assert!(
        code.starts_with(expected_prefix),
        "Error code '{}' must start with prefix '{}'",
        code,
        expected_prefix
    );
    assert!(
        is_upper_snake_case(code),
        "Error code '{}' must be UPPER_SNAKE_CASE",
        code
    );
}

/// Runs [`assert_error_code`] over every given variant.
pub fn assert_error_codes<E: ErrorCode>(errors: &[E], expected_prefix: &str) {
    for err in errors {
        assert_error_code(err, expected_prefix);
    }
}

fn is_upper_snake_case(s: &str) -> bool {
    if s.is_empty() || s.starts_with('_') || s.ends_with('_') || s.contains("__") {
        return false;
    }
    s.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    enum ProbeError {
        Unreachable,
        Rejected,
    }

    impl ErrorCode for ProbeError {
        fn code(&self) -> &'static str {
            match self {
                Self::Unreachable => "PROBE_UNREACHABLE",
                Self::Rejected => "PROBE_REJECTED",
            }
        }

        fn is_recoverable(&self) -> bool {
            matches!(self, Self::Unreachable)
        }
    }

    #[test]
    fn codes_and_recoverability() {
        assert_eq!(ProbeError::Unreachable.code(), "PROBE_UNREACHABLE");
        assert!(ProbeError::Unreachable.is_recoverable());
        assert!(!ProbeError::Rejected.is_recoverable());
    }

    #[test]
    fn all_variants_follow_convention() {
        assert_error_codes(&[ProbeError::Unreachable, ProbeError::Rejected], "PROBE_");
    }

    #[test]
    #[should_panic(expected = "must start with prefix")]
    fn wrong_prefix_panics() {
        assert_error_code(&ProbeError::Rejected, "RPC_");
    }

    #[test]
    fn upper_snake_case_detection() {
        assert!(is_upper_snake_case("KERNEL_NOT_FOUND"));
        assert!(is_upper_snake_case("RPC_429"));
        assert!(!is_upper_snake_case(""));
        assert!(!is_upper_snake_case("kernel"));
        assert!(!is_upper_snake_case("_KERNEL"));
        assert!(!is_upper_snake_case("KERNEL_"));
        assert!(!is_upper_snake_case("KERNEL__X"));
    }
}

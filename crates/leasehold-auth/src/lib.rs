//! Access control for leasehold slices.
//!
//! The kernel wrapper runs every mutating request through the target
//! slice's [`AccessGuard`] before the kernel sees it. Denials surface as
//! [`AccessDenied`] and leave state untouched.
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Permission`] | RESERVE / UPDATE / QUERY bitflags |
//! | [`AccessGuard`] | slice owner plus explicit grants |
//! | [`AccessDenied`] | `AUTH_*` error |

mod error;
mod guard;
mod permission;

pub use error::AccessDenied;
pub use guard::AccessGuard;
pub use permission::Permission;

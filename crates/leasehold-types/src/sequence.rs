//! Sequence arbitration.
//!
//! Every reservation and delegation keeps a `sequence_in` counter holding
//! the last accepted incoming sequence number. Transport may reorder or
//! duplicate messages, so freshness is decided here and nowhere else.
//!
//! | Incoming vs local | Pending op | Result |
//! |-------------------|------------|--------|
//! | greater | no | [`Greater`](SequenceComparison::Greater) |
//! | greater | yes | [`InProgress`](SequenceComparison::InProgress) |
//! | equal | any | [`Equal`](SequenceComparison::Equal) |
//! | smaller | any | [`Smaller`](SequenceComparison::Smaller) |

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Verdict of [`compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceComparison {
    /// Fresh request: process it.
    Greater,
    /// Stale request: drop with a warning.
    Smaller,
    /// Duplicate of the last processed request: resend the last update.
    Equal,
    /// Fresh request while another operation is still pending: drop.
    InProgress,
}

/// Classifies an incoming sequence number against the local one.
///
/// # Example
///
/// ```
/// use leasehold_types::{compare_sequence, SequenceComparison};
///
/// assert_eq!(compare_sequence(2, 1, false), SequenceComparison::Greater);
/// assert_eq!(compare_sequence(2, 1, true), SequenceComparison::InProgress);
/// assert_eq!(compare_sequence(1, 1, true), SequenceComparison::Equal);
/// assert_eq!(compare_sequence(0, 1, false), SequenceComparison::Smaller);
/// ```
#[must_use]
pub fn compare(incoming: u64, local: u64, has_pending_op: bool) -> SequenceComparison {
    match incoming.cmp(&local) {
        Ordering::Greater if has_pending_op => SequenceComparison::InProgress,
        Ordering::Greater => SequenceComparison::Greater,
        Ordering::Equal => SequenceComparison::Equal,
        Ordering::Less => SequenceComparison::Smaller,
    }
}

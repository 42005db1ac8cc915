//! Lease and ticket terms.
//!
//! A [`Term`] is an immutable time interval. Extension produces a new
//! term that keeps the original `start` and marks where the extension
//! begins with `new_start`:
//!
//! ```text
//!  start              new_start           end
//!    |------ old ---------|------ new -------|
//! ```
//!
//! Invariant once constructed: `start <= new_start <= end`.

use crate::ErrorCode;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors raised when a term cannot be constructed or validated.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TermError {
    /// `start <= new_start <= end` does not hold.
    #[error("invalid term bounds: start={start}, new_start={new_start}, end={end}")]
    InvalidBounds {
        start: DateTime<Utc>,
        new_start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// The proposed term does not extend the current one.
    #[error("term ending {proposed_end} does not extend term ending {current_end}")]
    NotAnExtension {
        current_end: DateTime<Utc>,
        proposed_end: DateTime<Utc>,
    },
}

impl ErrorCode for TermError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidBounds { .. } => "TERM_INVALID_BOUNDS",
            Self::NotAnExtension { .. } => "TERM_NOT_AN_EXTENSION",
        }
    }

    fn is_recoverable(&self) -> bool {
        false
    }
}

/// Immutable time interval backing a ticket or lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    start: DateTime<Utc>,
    new_start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Term {
    /// Creates a term covering `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::InvalidBounds`] if `end < start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, TermError> {
        Self::with_new_start(start, start, end)
    }

    /// Creates a term with an explicit extension point.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::InvalidBounds`] unless `start <= new_start <= end`.
    pub fn with_new_start(
        start: DateTime<Utc>,
        new_start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self, TermError> {
        let term = Self {
            start,
            new_start,
            end,
        };
        term.validate()?;
        Ok(term)
    }

    /// Creates a term starting at `start` lasting `length`.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::InvalidBounds`] for a negative length.
    pub fn starting_at(start: DateTime<Utc>, length: Duration) -> Result<Self, TermError> {
        Self::new(start, start + length)
    }

    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub fn new_start(&self) -> DateTime<Utc> {
        self.new_start
    }

    #[must_use]
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Total length of the term.
    #[must_use]
    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    /// Checks the `start <= new_start <= end` invariant.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::InvalidBounds`] if the invariant is violated.
    pub fn validate(&self) -> Result<(), TermError> {
        if self.start <= self.new_start && self.new_start <= self.end {
            Ok(())
        } else {
            Err(TermError::InvalidBounds {
                start: self.start,
                new_start: self.new_start,
                end: self.end,
            })
        }
    }

    /// Returns a term with the same start, lengthened by `length`.
    ///
    /// The extension begins at the old end.
    ///
    /// # Example
    ///
    /// ```
    /// use chrono::{Duration, TimeZone, Utc};
    /// use leasehold_types::Term;
    ///
    /// let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    /// let term = Term::starting_at(start, Duration::hours(1)).unwrap();
    /// let longer = term.extend(Duration::hours(2));
    ///
    /// assert_eq!(longer.start(), term.start());
    /// assert_eq!(longer.new_start(), term.end());
    /// assert_eq!(longer.length(), Duration::hours(3));
    /// assert!(longer.extends_term(&term));
    /// ```
    #[must_use]
    pub fn extend(&self, length: Duration) -> Self {
        let length = length.max(Duration::zero());
        Self {
            start: self.start,
            new_start: self.end,
            end: self.end + length,
        }
    }

    /// Returns the term moved in time by `by`.
    #[must_use]
    pub fn shift(&self, by: Duration) -> Self {
        Self {
            start: self.start + by,
            new_start: self.new_start + by,
            end: self.end + by,
        }
    }

    /// Returns a term with the same start and a new length.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::InvalidBounds`] for a negative length.
    pub fn change_length(&self, length: Duration) -> Result<Self, TermError> {
        let end = self.start + length;
        Self::with_new_start(self.start, self.new_start.min(end), end)
    }

    /// Whether `when` falls inside `[start, end]`.
    #[must_use]
    pub fn contains(&self, when: DateTime<Utc>) -> bool {
        self.start <= when && when <= self.end
    }

    /// Whether `other` lies entirely inside this term.
    #[must_use]
    pub fn contains_term(&self, other: &Term) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Whether the term ends strictly before `when`.
    #[must_use]
    pub fn ends_before(&self, when: DateTime<Utc>) -> bool {
        self.end < when
    }

    /// Whether the term is over at `when`.
    #[must_use]
    pub fn expired(&self, when: DateTime<Utc>) -> bool {
        when > self.end
    }

    /// Whether this term is a valid extension of `old`: same start, later end.
    #[must_use]
    pub fn extends_term(&self, old: &Term) -> bool {
        self.start == old.start && self.end > old.end
    }

    /// Checks that this term extends `old`.
    ///
    /// # Errors
    ///
    /// Returns [`TermError::NotAnExtension`] otherwise.
    pub fn ensure_extends(&self, old: &Term) -> Result<(), TermError> {
        if self.extends_term(old) {
            Ok(())
        } else {
            Err(TermError::NotAnExtension {
                current_end: old.end,
                proposed_end: self.end,
            })
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} .. {}]",
            self.start.format("%Y-%m-%dT%H:%M:%S"),
            self.end.format("%Y-%m-%dT%H:%M:%S")
        )
    }
}

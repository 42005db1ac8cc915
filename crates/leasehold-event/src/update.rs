//! Update channel.
//!
//! [`UpdateData`] rides along with every update and failure message. It
//! records whether the sender considers the operation failed, a status
//! message, and a trail of human-readable events that accumulates as the
//! reservation moves between actors.

use serde::{Deserialize, Serialize};

/// Status and event trail attached to an update message.
///
/// # Example
///
/// ```
/// use leasehold_event::UpdateData;
///
/// let mut update = UpdateData::default();
/// update.post("ticket issued");
/// update.post_event("bound 10 units");
/// assert!(!update.is_failed());
///
/// let mut remote = UpdateData::default();
/// remote.error("inventory exhausted");
///
/// update.absorb(&remote);
/// assert!(update.is_failed());
/// assert_eq!(update.message(), Some("inventory exhausted"));
/// assert_eq!(update.events().len(), 1);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default)]
    failed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    events: Vec<String>,
}

impl UpdateData {
    /// Sets the status message without marking failure.
    pub fn post(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    /// Appends an event to the trail.
    pub fn post_event(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    /// Marks the update as failed with `message`.
    pub fn error(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.message = Some(message.into());
    }

    /// Folds a received update into this one.
    ///
    /// A failure on either side sticks; the incoming message wins when
    /// present; events are appended.
    pub fn absorb(&mut self, other: &UpdateData) {
        if other.failed {
            self.failed = true;
        }
        if other.message.is_some() {
            self.message.clone_from(&other.message);
        }
        self.events.extend(other.events.iter().cloned());
    }

    /// Resets to the default (successful, empty) state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[must_use]
    pub fn events(&self) -> &[String] {
        &self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_does_not_fail() {
        let mut u = UpdateData::default();
        u.post("ok");
        assert!(!u.is_failed());
        assert_eq!(u.message(), Some("ok"));
    }

    #[test]
    fn absorb_keeps_local_failure() {
        let mut local = UpdateData::default();
        local.error("local broke");
        let mut remote = UpdateData::default();
        remote.post_event("remote event");

        local.absorb(&remote);
        assert!(local.is_failed());
        assert_eq!(local.message(), Some("local broke"));
        assert_eq!(local.events(), ["remote event".to_string()]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut u = UpdateData::default();
        u.error("x");
        u.post_event("y");
        u.clear();
        assert_eq!(u, UpdateData::default());
    }

    #[test]
    fn empty_update_serializes_compactly() {
        let json = serde_json::to_string(&UpdateData::default()).unwrap();
        assert_eq!(json, r#"{"failed":false}"#);
    }
}

//! Event stream cursors.

use std::fmt;

/// Opaque cursor marking a position in the event stream.
///
/// A token records the epoch of the connection that issued it. Tokens from
/// an earlier epoch are never valid against a later one: after a reconnect
/// the synchronizer must full-load and obtain a fresh token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SyncToken {
    value: String,
    epoch: u64,
}

impl SyncToken {
    /// Creates a token issued under `epoch`.
    pub fn new(value: impl Into<String>, epoch: u64) -> Self {
        Self {
            value: value.into(),
            epoch,
        }
    }

    /// Returns the wire form.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Returns the issuing epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns true if this token was issued under `epoch`.
    pub fn is_issued_by(&self, epoch: u64) -> bool {
        self.epoch == epoch
    }

    /// Returns the token that follows this one, in the same epoch.
    pub fn advance(&self, value: impl Into<String>) -> Self {
        Self::new(value, self.epoch)
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.value, self.epoch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_keeps_epoch() {
        let t0 = SyncToken::new("T0", 3);
        let t1 = t0.advance("T1");
        assert_eq!(t1.value(), "T1");
        assert_eq!(t1.epoch(), 3);
        assert!(t1.is_issued_by(3));
        assert!(!t1.is_issued_by(4));
    }

    #[test]
    fn display() {
        assert_eq!(SyncToken::new("42", 1).to_string(), "42@1");
    }
}

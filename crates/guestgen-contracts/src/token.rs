use std::time::{Duration, Instant};

/// A short-lived anti-automation credential. Usable iff `now < expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationToken {
    pub value: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
}

impl VerificationToken {
    pub fn new(value: impl Into<String>, acquired_at: Instant, validity: Duration) -> Self {
        Self {
            value: value.into(),
            acquired_at,
            expires_at: acquired_at + validity,
        }
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        now < self.expires_at
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

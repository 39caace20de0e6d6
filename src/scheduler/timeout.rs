//! Per-attempt wall-clock timeouts
//!
//! Each running attempt carries a deadline computed at launch. The scheduler
//! checks deadlines on every tick; expiry is a transient failure charged to
//! the retry budget. Time is always passed in so behavior is reproducible.

use chrono::{DateTime, Duration, Utc};

/// Upper bound for `build.timeout_seconds`.
pub const MAX_BUILD_TIMEOUT_SECS: u64 = 86_400;

/// Timeout validation errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimeoutValidationError {
    #[error("build timeout must be in (0, {MAX_BUILD_TIMEOUT_SECS}] seconds, got {value}")]
    OutOfBounds { value: u64 },
}

/// Validate a build timeout in seconds.
pub fn validate_build_timeout(seconds: u64) -> Result<(), TimeoutValidationError> {
    if seconds == 0 || seconds > MAX_BUILD_TIMEOUT_SECS {
        return Err(TimeoutValidationError::OutOfBounds { value: seconds });
    }
    Ok(())
}

/// Timeout check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    Ok,
    Expired,
}

impl TimeoutStatus {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutStatus::Expired)
    }
}

/// Deadline tracking for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTimer {
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
}

impl AttemptTimer {
    pub fn start(started_at: DateTime<Utc>, timeout_seconds: u64) -> Self {
        let secs = timeout_seconds.min(MAX_BUILD_TIMEOUT_SECS) as i64;
        Self {
            started_at,
            deadline: started_at + Duration::seconds(secs),
        }
    }

    /// Expired once `now` is past the deadline.
    pub fn check(&self, now: DateTime<Utc>) -> TimeoutStatus {
        if now > self.deadline {
            TimeoutStatus::Expired
        } else {
            TimeoutStatus::Ok
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        now - self.started_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let left = self.deadline - now;
        if left < Duration::zero() {
            Duration::zero()
        } else {
            left
        }
    }
}

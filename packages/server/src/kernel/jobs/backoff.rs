//! Poll and retry pacing.
//!
//! [`PollHints`] tells clients how long to wait before polling again, based
//! on how soon the job is likely to change state. [`retry_delay`] spaces out
//! worker retries of a failed attempt.

use std::time::Duration;

use chrono::{DateTime, Utc};

use super::job::QueueState;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Suggested wait before the next status poll, per state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollHints {
    pub active: Duration,
    pub waiting: Duration,
    pub paused: Duration,
    /// Used for `delayed` jobs without a known `run_at`
    pub delayed_fallback: Duration,
    pub delayed_min: Duration,
    pub delayed_max: Duration,
    /// `unknown` and `not_found`
    pub unknown: Duration,
}

impl Default for PollHints {
    fn default() -> Self {
        Self {
            active: Duration::from_secs(1),
            waiting: Duration::from_secs(3),
            paused: Duration::from_secs(5),
            delayed_fallback: Duration::from_secs(5),
            delayed_min: Duration::from_secs(1),
            delayed_max: Duration::from_secs(30),
            unknown: Duration::from_secs(8),
        }
    }
}

impl PollHints {
    /// `None` for states that will not change again.
    pub fn for_state(
        &self,
        state: QueueState,
        run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<Duration> {
        match state {
            QueueState::Completed | QueueState::Failed | QueueState::Gone => None,
            QueueState::Active => Some(self.active),
            QueueState::Waiting => Some(self.waiting),
            QueueState::Paused => Some(self.paused),
            QueueState::Delayed => Some(match run_at {
                Some(run_at) => (run_at - now)
                    .to_std()
                    .unwrap_or(Duration::ZERO)
                    .clamp(self.delayed_min, self.delayed_max),
                None => self.delayed_fallback,
            }),
            QueueState::NotFound | QueueState::Unknown => Some(self.unknown),
        }
    }
}

/// Whole seconds for a `Retry-After` header, rounded up.
pub fn retry_after_secs(delay: Duration) -> u64 {
    let secs = delay.as_secs();
    if delay.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Delay before retrying after failed attempt number `attempts` (1-based):
/// `base * 2^(attempts - 1)`, capped at one hour.
pub fn retry_delay(base_ms: i64, attempts: i32) -> Duration {
    let base = Duration::from_millis(base_ms.max(0) as u64);
    let exponent = attempts.saturating_sub(1).clamp(0, 31) as u32;
    base.checked_mul(1u32 << exponent)
        .unwrap_or(MAX_RETRY_DELAY)
        .min(MAX_RETRY_DELAY)
}

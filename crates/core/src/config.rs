//! Tunable timing for retries and convergence waits.
//!
//! These are the only knobs the reconciliation core exposes. Durations
//! serialize as integer milliseconds.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing policy for one retry or convergence call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total wall-clock budget, measured from the first attempt.
    #[serde(rename = "timeoutMs", with = "duration_millis")]
    pub timeout: Duration,
    /// Fixed wait between attempts / polls.
    #[serde(rename = "minIntervalMs", with = "duration_millis")]
    pub min_interval: Duration,
    /// Wait before the very first convergence check.
    #[serde(rename = "delayMs", with = "duration_millis")]
    pub delay: Duration,
    /// Matching observations in a row needed to declare convergence.
    pub required_consecutive_successes: u32,
    /// Optional cap on retry attempts, on top of the timeout.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5 * 60),
            min_interval: Duration::from_millis(500),
            delay: Duration::ZERO,
            required_consecutive_successes: 1,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(timeout: Duration, min_interval: Duration) -> Self {
        Self {
            timeout,
            min_interval,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_required_successes(mut self, required: u32) -> Self {
        self.required_consecutive_successes = required;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Consecutive matches required, never less than one.
    pub fn required_successes(&self) -> u32 {
        self.required_consecutive_successes.max(1)
    }

    /// Tolerates read-after-write lag: a bounded number of not-found reads.
    pub fn read_after_write() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(2)).with_max_attempts(10)
    }

    /// Membership propagation after a create.
    pub fn membership_create() -> Self {
        Self::new(Duration::from_secs(60 * 60), Duration::from_secs(5))
            .with_delay(Duration::from_secs(5))
            .with_required_successes(2)
    }

    /// Membership propagation after an update.
    pub fn membership_update() -> Self {
        Self::membership_create().with_required_successes(3)
    }

    /// Waiting for a freshly written entity to report itself ready.
    pub fn readiness() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(2)).with_delay(Duration::from_secs(1))
    }

    /// Waiting for a deleted entity to disappear from reads.
    pub fn deletion() -> Self {
        Self::new(Duration::from_secs(5 * 60), Duration::from_secs(3))
            .with_delay(Duration::from_secs(1))
            .with_required_successes(2)
    }
}

/// Per-operation policies used by the resource dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherConfig {
    pub create: RetryPolicy,
    pub read: RetryPolicy,
    pub update: RetryPolicy,
    pub delete: RetryPolicy,
    pub readiness: RetryPolicy,
    pub deletion: RetryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            create: RetryPolicy::default(),
            read: RetryPolicy::read_after_write(),
            update: RetryPolicy::default(),
            delete: RetryPolicy::default(),
            readiness: RetryPolicy::readiness(),
            deletion: RetryPolicy::deletion(),
        }
    }
}

/// Policies used by the group membership reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MembershipConfig {
    /// Retry policy for each individual add/remove/list call.
    pub call: RetryPolicy,
    pub create: RetryPolicy,
    pub update: RetryPolicy,
    pub delete: RetryPolicy,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            call: RetryPolicy::default(),
            create: RetryPolicy::membership_create(),
            update: RetryPolicy::membership_update(),
            delete: RetryPolicy::membership_create(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Runtime tuning.
//!
//! Loaded as part of the daemon configuration; every field has a default so
//! an empty section is valid.

use serde::Deserialize;
use std::time::Duration;

/// Worker, lease and timer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeConfig {
    /// Number of worker loops per process.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Instances claimed per poll.
    #[serde(default = "default_claim_batch")]
    pub claim_batch: usize,

    /// Lease length in seconds. A crashed worker's instances become
    /// claimable once it expires. Live claims renew it every third of it.
    #[serde(default = "default_lease_ttl_seconds")]
    pub lease_ttl_seconds: u64,

    /// Pause between polls that found no work, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on rounds run while holding one lease.
    #[serde(default = "default_max_rounds_per_claim")]
    pub max_rounds_per_claim: usize,

    /// Pause between due-wait scans, in milliseconds.
    #[serde(default = "default_timer_interval_ms")]
    pub timer_interval_ms: u64,

    /// Waits expired per scan.
    #[serde(default = "default_timer_batch")]
    pub timer_batch: usize,

    /// How long a timed-out handler may take to observe cancellation, in milliseconds.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_claim_batch() -> usize {
    8
}

fn default_lease_ttl_seconds() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_max_rounds_per_claim() -> usize {
    64
}

fn default_timer_interval_ms() -> u64 {
    1000
}

fn default_timer_batch() -> usize {
    100
}

fn default_cancel_grace_ms() -> u64 {
    500
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            claim_batch: default_claim_batch(),
            lease_ttl_seconds: default_lease_ttl_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            max_rounds_per_claim: default_max_rounds_per_claim(),
            timer_interval_ms: default_timer_interval_ms(),
            timer_batch: default_timer_batch(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    /// How often a claim in progress renews its lease.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_ttl() / 3).max(Duration::from_millis(100))
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn timer_interval(&self) -> Duration {
        Duration::from_millis(self.timer_interval_ms)
    }

    #[must_use]
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

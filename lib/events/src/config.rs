//! Event bus and NATS settings.

use serde::Deserialize;
use std::time::Duration;

/// Lane and retry settings for event ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BusConfig {
    /// Sequential lanes tenants are hashed onto.
    #[serde(default = "default_lanes")]
    pub lanes: usize,

    /// Events buffered per lane before senders wait.
    #[serde(default = "default_lane_capacity")]
    pub lane_capacity: usize,

    /// Attempts per event before it is logged and dropped.
    #[serde(default = "default_ingest_attempts")]
    pub ingest_attempts: u32,

    /// Pause between ingest attempts, in milliseconds.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_lanes() -> usize {
    8
}

fn default_lane_capacity() -> usize {
    1024
}

fn default_ingest_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    200
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            lane_capacity: default_lane_capacity(),
            ingest_attempts: default_ingest_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl BusConfig {
    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Where domain events are consumed from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NatsConfig {
    /// Consume from NATS at all. Events can still be ingested in-process.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_url")]
    pub url: String,

    /// Subject filter, wildcards allowed.
    #[serde(default = "default_subject")]
    pub subject: String,

    /// Subject filter for external signals such as approval decisions.
    #[serde(default = "default_signal_subject")]
    pub signal_subject: String,

    /// Queue group shared by engine processes so each event is consumed once.
    #[serde(default)]
    pub queue_group: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_subject() -> String {
    "tms.events.>".to_string()
}

fn default_signal_subject() -> String {
    "tms.signals.>".to_string()
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            url: default_url(),
            subject: default_subject(),
            signal_subject: default_signal_subject(),
            queue_group: None,
        }
    }
}

impl NatsConfig {
    /// Creates a config for `url` with the default subject.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

//! Daemon error types.

use std::fmt;

/// Failures that stop the engine daemon from starting or running.
#[derive(Debug)]
pub enum DaemonError {
    /// Configuration could not be loaded or is invalid.
    Config { reason: String },
    /// The database could not be reached.
    Database { reason: String },
    /// Schema migrations failed.
    Migration { reason: String },
    /// Published definitions could not be loaded.
    Definitions { reason: String },
    /// The action registry could not be assembled.
    Registry { reason: String },
    /// The event source could not be started.
    Events { reason: String },
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "invalid configuration: {reason}"),
            Self::Database { reason } => write!(f, "database unavailable: {reason}"),
            Self::Migration { reason } => write!(f, "migrations failed: {reason}"),
            Self::Definitions { reason } => write!(f, "failed to load definitions: {reason}"),
            Self::Registry { reason } => write!(f, "failed to build action registry: {reason}"),
            Self::Events { reason } => write!(f, "event source failed: {reason}"),
        }
    }
}

impl std::error::Error for DaemonError {}

impl From<config::ConfigError> for DaemonError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config {
            reason: e.to_string(),
        }
    }
}

//! Retry policy for handler steps.
//!
//! A definition may carry top-level retry defaults and each action step may
//! override individual fields. The delay before attempt `n + 1` is
//! `min(initial * multiplier^(n - 1), max)` spread upward by a random
//! fraction of at most `jitter`, so a retry never fires before its base
//! delay.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_JITTER: f64 = 0.2;

/// Retry settings as written in a definition document. Every field is optional.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl RetrySpec {
    /// Lists values that cannot form a usable policy.
    #[must_use]
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.max_attempts == Some(0) {
            problems.push("max_attempts must be at least 1".to_string());
        }
        if let Some(multiplier) = self.multiplier {
            if !multiplier.is_finite() || multiplier < 1.0 {
                problems.push("multiplier must be a finite number >= 1".to_string());
            }
        }
        if let Some(jitter) = self.jitter {
            if !(0.0..=1.0).contains(&jitter) {
                problems.push("jitter must be between 0 and 1".to_string());
            }
        }
        if let (Some(initial), Some(max)) = (self.initial_backoff_ms, self.max_backoff_ms) {
            if initial > max {
                problems.push("initial_backoff_ms must not exceed max_backoff_ms".to_string());
            }
        }
        problems
    }
}

/// A fully resolved retry policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Layers definition defaults and then a step override over the built-in defaults.
    #[must_use]
    pub fn resolve(defaults: Option<&RetrySpec>, step: Option<&RetrySpec>) -> Self {
        let mut policy = Self::default();
        for spec in [defaults, step].into_iter().flatten() {
            policy.apply(spec);
        }
        policy
    }

    fn apply(&mut self, spec: &RetrySpec) {
        if let Some(max_attempts) = spec.max_attempts {
            self.max_attempts = max_attempts.max(1);
        }
        if let Some(ms) = spec.initial_backoff_ms {
            self.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = spec.max_backoff_ms {
            self.max_backoff = Duration::from_millis(ms);
        }
        if let Some(multiplier) = spec.multiplier {
            if multiplier.is_finite() && multiplier >= 1.0 {
                self.multiplier = multiplier;
            }
        }
        if let Some(jitter) = spec.jitter {
            self.jitter = jitter.clamp(0.0, 1.0);
        }
    }

    /// True if a failed `attempt` may be followed by another one.
    #[must_use]
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// The delay after failed `attempt` before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let max = self.max_backoff.as_secs_f64();
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= max {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// The delay after failed `attempt`, with jitter.
    ///
    /// Jitter only lengthens the delay: the result lies in
    /// `[base, base * (1 + jitter)]`, never below the base delay. A `jitter`
    /// of 0.2 therefore means up to 20% longer, not plus or minus 20%.
    #[must_use]
    pub fn delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        base.mul_f64(1.0 + rng.gen_range(0.0..=jitter))
    }
}

//! Step execution records.
//!
//! Records are append-only. The store assigns each a sequence number; the
//! record with the highest sequence for (instance, step) is authoritative.

use crate::handler::HandlerError;
use crate::step::StepId;
use chrono::{DateTime, Utc};
use haulflow_core::InstanceId;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    /// Failed with a retry scheduled.
    Retrying,
    /// Not executed: condition false or branch cancelled.
    Skipped,
    /// Waiting for an event or approval.
    Suspended,
}

impl StepOutcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Skipped => "skipped",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            Self::Success,
            Self::Failed,
            Self::Retrying,
            Self::Skipped,
            Self::Suspended,
        ]
        .into_iter()
        .find(|outcome| outcome.as_str() == s)
        .ok_or_else(|| format!("unknown step outcome '{s}'"))
    }
}

/// One execution attempt of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub instance: InstanceId,
    /// Assigned by the store on commit; zero until then.
    pub seq: u64,
    pub step: StepId,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub result: Option<JsonValue>,
    pub error: Option<HandlerError>,
}

impl StepRecord {
    #[must_use]
    pub fn new(
        instance: InstanceId,
        step: StepId,
        attempt: u32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        outcome: StepOutcome,
    ) -> Self {
        Self {
            instance,
            seq: 0,
            step,
            attempt,
            started_at,
            finished_at,
            outcome,
            result: None,
            error: None,
        }
    }

    #[must_use]
    pub fn with_result(mut self, result: JsonValue) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: HandlerError) -> Self {
        self.error = Some(error);
        self
    }
}

/// The authoritative record of each step: the one with the highest sequence.
#[must_use]
pub fn latest_by_step(records: &[StepRecord]) -> std::collections::BTreeMap<&StepId, &StepRecord> {
    let mut latest = std::collections::BTreeMap::new();
    for record in records {
        latest
            .entry(&record.step)
            .and_modify(|current: &mut &StepRecord| {
                if record.seq > current.seq {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerErrorKind;

    #[test]
    fn highest_sequence_wins() {
        let instance = InstanceId::new();
        let now = Utc::now();
        let record = |seq, outcome| {
            let mut record = StepRecord::new(instance, StepId::from("call"), seq as u32, now, now, outcome);
            record.seq = seq;
            record
        };
        let records = vec![
            record(2, StepOutcome::Retrying)
                .with_error(HandlerError::new(HandlerErrorKind::Upstream, "503")),
            record(5, StepOutcome::Success),
            record(3, StepOutcome::Retrying),
        ];
        let latest = latest_by_step(&records);
        assert_eq!(latest[&StepId::from("call")].outcome, StepOutcome::Success);
    }
}

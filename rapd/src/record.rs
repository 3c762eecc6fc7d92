//! Per-action structured log records.
//!
//! One record is mutated by the action during execution and read by an
//! external logger sink at completion. Single writer per action.

use crate::result::{CommandResult, ResultStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// Event names recorded as time intervals on records.
pub const EVENT_PROXY_EXECUTION: &str = "proxy_execution";
pub const EVENT_INPUT_PROCESSING: &str = "input_processing";
pub const EVENT_LOCAL_COMMAND_EXECUTION: &str = "local_command_execution";
pub const EVENT_REMOTE_COMMAND_EXECUTION: &str = "remote_command_execution";
pub const EVENT_RACING_FINALIZATION_OVERHEAD: &str = "racing_finalization_overhead";
pub const EVENT_UPDATE_CACHED_RESULT: &str = "update_cached_result";
pub const EVENT_DEPS_VALIDATION: &str = "deps_validation";

/// A closed or still-open time interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInterval {
    pub from: DateTime<Utc>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeInterval {
    pub fn starting(from: DateTime<Utc>) -> Self {
        Self { from, to: None }
    }

    pub fn closed(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to: Some(to) }
    }
}

/// Bookkeeping for the local side of an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalMetadata {
    pub result: Option<CommandResult>,
    /// A local process actually began executing. It may not have completed
    /// successfully.
    pub executed_locally: bool,
    /// A remote cache hit passed deps-file verification (or needed none).
    pub valid_cache_hit: bool,
    /// A local result was published to the remote cache.
    pub updated_cache: bool,
    pub labels: HashMap<String, String>,
    pub environment: Vec<String>,
}

/// Bookkeeping for the remote side of an action, populated from the
/// execution context's metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteMetadata {
    pub result: Option<CommandResult>,
    pub cache_hit: bool,
    pub action_digest: String,
    pub num_output_files: u64,
    pub total_output_bytes: u64,
    pub event_times: HashMap<String, TimeInterval>,
}

/// Per-action structured record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub completion_status: Option<ResultStatus>,
    pub local_metadata: LocalMetadata,
    pub remote_metadata: Option<RemoteMetadata>,
    pub event_times: HashMap<String, TimeInterval>,
}

impl LogRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close an event interval that started at `from`.
    pub fn record_event_time(&mut self, event: &str, from: DateTime<Utc>) {
        self.event_times
            .insert(event.to_string(), TimeInterval::closed(from, Utc::now()));
    }

    /// Merge all event times from another record, overwriting duplicates.
    /// Used to fold a race arm's private record into the action's record.
    pub fn copy_event_times_from(&mut self, other: &LogRecord) {
        for (event, interval) in &other.event_times {
            self.event_times.insert(event.clone(), interval.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_event_time_closes_interval() {
        let mut rec = LogRecord::new();
        let from = Utc::now();
        rec.record_event_time(EVENT_PROXY_EXECUTION, from);
        let interval = &rec.event_times[EVENT_PROXY_EXECUTION];
        assert_eq!(interval.from, from);
        let to = interval.to.expect("interval should be closed");
        assert!(to >= from);
    }

    #[test]
    fn test_copy_event_times_merges_and_overwrites() {
        let mut a = LogRecord::new();
        let mut b = LogRecord::new();
        let t0 = Utc::now();
        a.record_event_time(EVENT_PROXY_EXECUTION, t0);
        b.record_event_time(EVENT_LOCAL_COMMAND_EXECUTION, t0);
        b.record_event_time(EVENT_PROXY_EXECUTION, t0);

        a.copy_event_times_from(&b);
        assert_eq!(a.event_times.len(), 2);
        assert_eq!(
            a.event_times[EVENT_PROXY_EXECUTION],
            b.event_times[EVENT_PROXY_EXECUTION]
        );
    }

    #[test]
    fn test_default_record_is_empty() {
        let rec = LogRecord::new();
        assert!(rec.remote_metadata.is_none());
        assert!(!rec.local_metadata.executed_locally);
        assert!(rec.event_times.is_empty());
    }

    // Records are handed to an external logger sink as JSON.
    #[test]
    fn test_record_round_trips_through_json() {
        let mut rec = LogRecord::new();
        rec.completion_status = Some(ResultStatus::Success);
        rec.local_metadata.executed_locally = true;
        rec.record_event_time(EVENT_LOCAL_COMMAND_EXECUTION, Utc::now());

        let json = serde_json::to_string(&rec).unwrap();
        let back: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.completion_status, Some(ResultStatus::Success));
        assert!(back.local_metadata.executed_locally);
        assert_eq!(
            back.event_times[EVENT_LOCAL_COMMAND_EXECUTION],
            rec.event_times[EVENT_LOCAL_COMMAND_EXECUTION]
        );
    }
}

//! Scheduler types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::trigger::Trigger;

/// Keyword arguments passed to a job body.
pub type Kwargs = Map<String, Value>;

/// What a job runs when it fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobBody {
    /// A function registered in the [`crate::JobRegistry`].
    Function { id: String },
    /// Inline code evaluated by the registry's sandbox.
    Code { source: String },
}

impl JobBody {
    /// Body that calls a registered function.
    pub fn function(id: impl Into<String>) -> Self {
        Self::Function { id: id.into() }
    }

    /// Body that evaluates inline code.
    pub fn code(source: impl Into<String>) -> Self {
        Self::Code {
            source: source.into(),
        }
    }
}

impl fmt::Display for JobBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function { id } => f.write_str(id),
            Self::Code { .. } => f.write_str("<inline code>"),
        }
    }
}

/// A scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job id.
    pub id: String,
    /// Human-readable name for the job.
    pub name: String,
    /// When the job fires.
    pub trigger: Trigger,
    /// What the job runs.
    pub body: JobBody,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: Kwargs,
    /// Ceiling on concurrently running instances of this job.
    pub max_instances: u32,
    /// How late a run may start before it is skipped as a misfire.
    pub misfire_grace_seconds: u64,
    /// Whether the job is individually paused.
    pub paused: bool,
    /// When this job should next run. `None` means not scheduled.
    pub next_run_time: Option<DateTime<Utc>>,
    /// Instances running at the time this snapshot was taken.
    pub currently_running: u32,
}

impl Job {
    /// Check if this job is due to run at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.paused && self.next_run_time.is_some_and(|t| t <= now)
    }

    /// Time between the scheduled run time and `now`, if scheduled.
    pub fn lateness(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.next_run_time.map(|t| now - t)
    }

    /// Whether a run discovered at `now` is past the misfire grace period.
    pub fn is_misfire(&self, now: DateTime<Utc>) -> bool {
        let grace = i64::try_from(self.misfire_grace_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        self.lateness(now).is_some_and(|late| late > grace)
    }
}

/// Request to create a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Job id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub trigger: Trigger,
    pub body: JobBody,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
    /// Defaults to the scheduler's configured value.
    #[serde(default)]
    pub max_instances: Option<u32>,
    /// Defaults to the scheduler's configured value.
    #[serde(default)]
    pub misfire_grace_seconds: Option<u64>,
}

impl NewJob {
    /// A job with no arguments and default limits.
    pub fn new(name: impl Into<String>, trigger: Trigger, body: JobBody) -> Self {
        Self {
            id: None,
            name: name.into(),
            trigger,
            body,
            args: Vec::new(),
            kwargs: Kwargs::new(),
            max_instances: None,
            misfire_grace_seconds: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = Some(max_instances);
        self
    }

    pub fn with_misfire_grace_seconds(mut self, seconds: u64) -> Self {
        self.misfire_grace_seconds = Some(seconds);
        self
    }
}

/// Partial update of an existing job. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub kwargs: Option<Kwargs>,
    #[serde(default)]
    pub max_instances: Option<u32>,
    #[serde(default)]
    pub misfire_grace_seconds: Option<u64>,
}

/// Outcome of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Record of one finished execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub job_id: String,
    pub job_name: String,
    /// When the body started running.
    pub executed_at: DateTime<Utc>,
    pub status: ExecutionStatus,
    /// Value returned by a successful body.
    pub result: Option<Value>,
    /// Failure message of an unsuccessful body.
    pub error: Option<String>,
    /// Panic payload when the body panicked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    /// Wall-clock time the body took, in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }
}

/// Process-wide scheduler state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// Not dispatching; no wake cycle exists.
    #[default]
    Stopped,
    /// Wake cycle active, due jobs are dispatched.
    Running,
    /// Wake cycle idle; job schedules are preserved.
    Paused,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
        }
    }
}

/// Result of a control operation (start, pause, resume, shutdown).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    /// The state changed.
    Applied {
        from: SchedulerState,
        to: SchedulerState,
    },
    /// The operation did not apply in the current state.
    NoOp { state: SchedulerState },
}

impl ControlOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// State after the operation.
    pub fn state(&self) -> SchedulerState {
        match self {
            Self::Applied { to, .. } => *to,
            Self::NoOp { state } => *state,
        }
    }
}

/// Snapshot returned by [`crate::Scheduler::scheduler_status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub job_count: usize,
    /// Earliest pending run while running; `None` when paused or stopped.
    pub next_wakeup: Option<DateTime<Utc>>,
    pub max_workers: usize,
    /// Job bodies currently executing.
    pub running_instances: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn job(next: Option<DateTime<Utc>>) -> Job {
        Job {
            id: "test".to_string(),
            name: "Test".to_string(),
            trigger: Trigger::every_seconds(60),
            body: JobBody::function("sample_job"),
            args: vec![],
            kwargs: Kwargs::new(),
            max_instances: 1,
            misfire_grace_seconds: 5,
            paused: false,
            next_run_time: next,
            currently_running: 0,
        }
    }

    #[test]
    fn test_job_is_due() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        assert!(job(Some(now)).is_due(now));
        assert!(job(Some(now - Duration::seconds(1))).is_due(now));
        assert!(!job(Some(now + Duration::seconds(1))).is_due(now));
        assert!(!job(None).is_due(now));

        let mut paused = job(Some(now));
        paused.paused = true;
        assert!(!paused.is_due(now));
    }

    #[test]
    fn test_misfire_boundary() {
        let scheduled = Utc.timestamp_opt(1_000, 0).unwrap();
        let j = job(Some(scheduled));
        // Exactly at the grace limit is still on time
        assert!(!j.is_misfire(scheduled + Duration::seconds(5)));
        assert!(j.is_misfire(scheduled + Duration::seconds(6)));
        assert!(!job(None).is_misfire(scheduled));
    }

    #[test]
    fn test_new_job_deserializes_with_defaults() {
        let new_job: NewJob = serde_json::from_value(json!({
            "name": "backup",
            "trigger": {"type": "interval", "hours": 1},
            "body": {"kind": "function", "id": "backup_database"},
            "kwargs": {"database_name": "main"}
        }))
        .unwrap();

        assert_eq!(new_job.id, None);
        assert!(new_job.args.is_empty());
        assert_eq!(new_job.kwargs.get("database_name"), Some(&json!("main")));
        assert_eq!(new_job.max_instances, None);
        assert_eq!(new_job.body, JobBody::function("backup_database"));
    }

    #[test]
    fn test_control_outcome_state() {
        let applied = ControlOutcome::Applied {
            from: SchedulerState::Stopped,
            to: SchedulerState::Running,
        };
        assert!(applied.is_applied());
        assert_eq!(applied.state(), SchedulerState::Running);

        let noop = ControlOutcome::NoOp {
            state: SchedulerState::Paused,
        };
        assert!(!noop.is_applied());
        assert_eq!(noop.state(), SchedulerState::Paused);
    }

    #[test]
    fn test_scheduler_state_default() {
        let state: SchedulerState = Default::default();
        assert_eq!(state, SchedulerState::Stopped);
        assert_eq!(state.to_string(), "stopped");
    }
}

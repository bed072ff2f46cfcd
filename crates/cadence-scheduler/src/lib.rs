//! In-process job scheduler for Cadence.
//!
//! This crate provides a scheduler that:
//! - Fires jobs on interval, cron and one-shot date triggers
//! - Bounds concurrency per job (`max_instances`) and globally (`max_workers`)
//! - Skips runs discovered past their misfire grace period
//! - Keeps a bounded execution history per job
//! - Resolves job bodies through a registry, with sandboxed inline code

mod builtin;
mod clock;
mod config;
mod cron;
mod error;
mod executor;
mod registry;
mod results;
mod sandbox;
mod scheduler;
mod store;
mod trigger;
mod types;

pub use builtin::{builtin_registry, register_builtins};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, MAX_WORKERS, MIN_WORKERS, SchedulerConfig};
pub use cron::{CronSchedule, SEARCH_HORIZON_YEARS};
pub use error::SchedulerError;
pub use executor::{ExecutionHandle, ExecutorPool, ShutdownReport};
pub use registry::{BodyError, BodyFuture, CodeSandbox, FunctionInfo, JobContext, JobFn, JobRegistry};
pub use results::{MAX_RESULTS_PER_JOB, ResultLog};
pub use sandbox::{DEFAULT_SANDBOX_TIMEOUT, DenoSandbox, SandboxError};
pub use scheduler::{DispatchOutcome, Scheduler};
pub use store::{Advanced, InstanceGuard, JobStore, MemoryJobStore};
pub use trigger::{CronTrigger, DateTrigger, IntervalTrigger, Trigger, TriggerError};
pub use types::{
    ControlOutcome, ExecutionResult, ExecutionStatus, Job, JobBody, JobPatch, Kwargs, NewJob,
    SchedulerState, SchedulerStatus,
};

//! Job scheduler implementation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify, RwLock, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::executor::{ExecutionHandle, ExecutorPool, ShutdownReport};
use crate::registry::{FunctionInfo, JobRegistry};
use crate::results::ResultLog;
use crate::store::{Advanced, InstanceGuard, JobStore, MemoryJobStore};
use crate::{
    ControlOutcome, ExecutionResult, Job, JobPatch, NewJob, SchedulerError, SchedulerState,
    SchedulerStatus,
};

/// Maximum sleep duration between scheduler checks.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// What happened to one due job during a dispatch pass.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// Handed to the executor pool.
    Submitted(ExecutionHandle),
    /// Discovered past its grace period and skipped.
    Misfired { lateness: chrono::Duration },
    /// Already running `max_instances` times; this run was skipped.
    Busy,
}

/// The job scheduler.
///
/// Cheap to clone; clones share the same jobs, history and loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    results: Arc<ResultLog>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<SchedulerState>,
    wake: Notify,
    /// Held by control operations; owns the loop task while one exists.
    control: Mutex<Option<JoinHandle<()>>>,
    pool: RwLock<Arc<ExecutorPool>>,
}

impl Scheduler {
    /// Create a stopped scheduler with an in-memory store and the system clock.
    pub fn new(config: SchedulerConfig, registry: JobRegistry) -> Result<Self, SchedulerError> {
        Self::with_parts(
            config,
            registry,
            Arc::new(MemoryJobStore::new()),
            Arc::new(SystemClock),
        )
    }

    /// Create a stopped scheduler over a given store and clock.
    pub fn with_parts(
        config: SchedulerConfig,
        registry: JobRegistry,
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, SchedulerError> {
        config
            .validate()
            .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;

        let registry = Arc::new(registry);
        let results = Arc::new(ResultLog::new());
        let pool = ExecutorPool::new(
            config.max_workers,
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&results),
            Arc::clone(&clock),
        );
        let (state_tx, _) = watch::channel(SchedulerState::Stopped);

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry,
                store,
                results,
                clock,
                state_tx,
                wake: Notify::new(),
                control: Mutex::new(None),
                pool: RwLock::new(Arc::new(pool)),
            }),
        })
    }

    /// Configuration the scheduler was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Current scheduler state.
    pub fn state(&self) -> SchedulerState {
        *self.inner.state_tx.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SchedulerState> {
        self.inner.state_tx.subscribe()
    }

    // ---- jobs -------------------------------------------------------------

    /// Add a job. Its first run time is computed from now.
    #[tracing::instrument(skip(self, new_job), fields(name = %new_job.name))]
    pub async fn add_job(&self, new_job: NewJob) -> Result<Job, SchedulerError> {
        let id = match new_job.id {
            Some(id) if id.trim().is_empty() => {
                return Err(SchedulerError::InvalidConfig(
                    "job id must not be empty".to_string(),
                ));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        // Bodies are resolved up front so a bad function id never enters the store
        self.inner.registry.resolve_body(&new_job.body)?;

        let job = Job {
            id: id.clone(),
            name: new_job.name,
            trigger: new_job.trigger,
            body: new_job.body,
            args: new_job.args,
            kwargs: new_job.kwargs,
            max_instances: new_job
                .max_instances
                .unwrap_or(self.inner.config.default_max_instances),
            misfire_grace_seconds: new_job
                .misfire_grace_seconds
                .unwrap_or(self.inner.config.default_misfire_grace_seconds),
            paused: false,
            next_run_time: None,
            currently_running: 0,
        };

        self.inner.store.add(job, self.inner.clock.now())?;
        self.inner.wake.notify_one();

        let job = self.inner.store.get(&id)?;
        info!(job_id = %job.id, trigger = %job.trigger, next_run_time = ?job.next_run_time, "added job");
        Ok(job)
    }

    /// Get a snapshot of a job.
    pub fn get_job(&self, id: &str) -> Result<Job, SchedulerError> {
        self.inner.store.get(id)
    }

    /// All jobs in the order they were added.
    pub fn list_jobs(&self) -> Vec<Job> {
        self.inner.store.list()
    }

    /// Remove a job and its execution history.
    ///
    /// Running instances finish, but their results are discarded.
    #[tracing::instrument(skip(self))]
    pub async fn remove_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let job = self.inner.store.remove(id)?;
        self.inner.results.purge(id);
        self.inner.wake.notify_one();
        info!(job_id = %id, "removed job");
        Ok(job)
    }

    /// Stop a job from firing until resumed.
    #[tracing::instrument(skip(self))]
    pub async fn pause_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let job = self.inner.store.set_paused(id, true, self.inner.clock.now())?;
        self.inner.wake.notify_one();
        info!(job_id = %id, "paused job");
        Ok(job)
    }

    /// Resume a paused job. Its next run is computed from now.
    #[tracing::instrument(skip(self))]
    pub async fn resume_job(&self, id: &str) -> Result<Job, SchedulerError> {
        let job = self.inner.store.set_paused(id, false, self.inner.clock.now())?;
        self.inner.wake.notify_one();
        info!(job_id = %id, next_run_time = ?job.next_run_time, "resumed job");
        Ok(job)
    }

    /// Apply a partial update to a job.
    #[tracing::instrument(skip(self, patch))]
    pub async fn modify_job(&self, id: &str, patch: JobPatch) -> Result<Job, SchedulerError> {
        let job = self.inner.store.update(id, &patch, self.inner.clock.now())?;
        self.inner.wake.notify_one();
        info!(job_id = %id, next_run_time = ?job.next_run_time, "modified job");
        Ok(job)
    }

    /// Run a job immediately, outside its trigger and misfire rules.
    ///
    /// Works in any scheduler state. Fails with [`SchedulerError::Busy`] when the
    /// job is already at `max_instances`.
    #[tracing::instrument(skip(self))]
    pub async fn run_job_now(&self, id: &str) -> Result<ExecutionHandle, SchedulerError> {
        let job = self.inner.store.get(id)?;
        let guard = InstanceGuard::acquire(&self.inner.store, id)?;
        let pool = self.inner.current_pool().await;
        info!(job_id = %id, "running job now");
        Ok(pool.submit(job, guard, None))
    }

    /// Recorded executions for a job, most recent first.
    pub fn job_history(&self, id: &str, limit: Option<usize>) -> Vec<ExecutionResult> {
        self.inner.results.history(id, limit)
    }

    /// Registered job functions, sorted by id.
    pub fn list_functions(&self) -> Vec<FunctionInfo> {
        self.inner.registry.list_functions()
    }

    /// Run one dispatch pass for `now` on a scheduler that is not running.
    ///
    /// Lets callers drive dispatch with their own clock. While the scheduler
    /// is running the wake cycle owns dispatch and this returns nothing.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<(String, DispatchOutcome)> {
        if self.state() == SchedulerState::Running {
            debug!("dispatch requested while running, left to the wake cycle");
            return Vec::new();
        }
        self.inner.dispatch_due(now).await
    }

    // ---- scheduler control -----------------------------------------------

    /// Start the wake cycle. Only valid when stopped.
    #[tracing::instrument(skip(self))]
    pub async fn scheduler_start(&self) -> ControlOutcome {
        let mut control = self.inner.control.lock().await;
        let from = self.state();
        if from != SchedulerState::Stopped {
            return ControlOutcome::NoOp { state: from };
        }

        self.inner.state_tx.send_replace(SchedulerState::Running);
        *control = Some(spawn_loop(Arc::clone(&self.inner)));
        info!(max_workers = self.inner.config.max_workers, "scheduler started");

        ControlOutcome::Applied {
            from,
            to: SchedulerState::Running,
        }
    }

    /// Withhold dispatch. Job schedules are preserved.
    #[tracing::instrument(skip(self))]
    pub async fn scheduler_pause(&self) -> ControlOutcome {
        self.transition(SchedulerState::Running, SchedulerState::Paused)
            .await
    }

    /// Resume dispatch. Overdue jobs are then handled by the misfire rules.
    #[tracing::instrument(skip(self))]
    pub async fn scheduler_resume(&self) -> ControlOutcome {
        self.transition(SchedulerState::Paused, SchedulerState::Running)
            .await
    }

    /// Stop the wake cycle and the executor pool.
    ///
    /// Running bodies are asked to cancel and given `wait_timeout` to finish
    /// before being aborted. The scheduler can be started again afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn scheduler_shutdown(&self, wait_timeout: Duration) -> ControlOutcome {
        let mut control = self.inner.control.lock().await;
        let from = self.state();
        if from == SchedulerState::Stopped {
            return ControlOutcome::NoOp { state: from };
        }

        info!(state = %from, "scheduler shutting down");
        self.inner.state_tx.send_replace(SchedulerState::Stopped);

        if let Some(handle) = control.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "scheduler loop ended abnormally");
            }
        }

        let report = self.inner.retire_pool(wait_timeout).await;
        info!(drained = report.drained, aborted = report.aborted, "scheduler shut down");

        ControlOutcome::Applied {
            from,
            to: SchedulerState::Stopped,
        }
    }

    /// Pull a snapshot of scheduler state.
    pub async fn scheduler_status(&self) -> SchedulerStatus {
        let state = self.state();
        SchedulerStatus {
            state,
            job_count: self.inner.store.len(),
            next_wakeup: match state {
                SchedulerState::Running => self.inner.store.next_wakeup(),
                _ => None,
            },
            max_workers: self.inner.current_pool().await.max_workers(),
            running_instances: self.inner.store.running_instances(),
        }
    }

    async fn transition(&self, from: SchedulerState, to: SchedulerState) -> ControlOutcome {
        let _control = self.inner.control.lock().await;
        let state = self.state();
        if state != from {
            return ControlOutcome::NoOp { state };
        }

        self.inner.state_tx.send_replace(to);
        info!(%from, %to, "scheduler state changed");
        ControlOutcome::Applied { from, to }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("state", &self.state())
            .field("jobs", &self.inner.store.len())
            .finish()
    }
}

impl Inner {
    fn fresh_pool(&self) -> ExecutorPool {
        ExecutorPool::new(
            self.config.max_workers,
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            Arc::clone(&self.results),
            Arc::clone(&self.clock),
        )
    }

    async fn current_pool(&self) -> Arc<ExecutorPool> {
        Arc::clone(&*self.pool.read().await)
    }

    async fn dispatch_due(&self, now: DateTime<Utc>) -> Vec<(String, DispatchOutcome)> {
        let due = self.store.due_jobs(now);
        if due.is_empty() {
            return Vec::new();
        }

        let pool = self.current_pool().await;
        let mut dispatched = Vec::with_capacity(due.len());

        for job in due {
            let Some(slot) = job.next_run_time else {
                continue;
            };
            let misfired = job.is_misfire(now);

            // Claim the slot before running it
            if !self.advance(&job, slot, now, misfired) {
                continue;
            }

            let outcome = if misfired {
                let lateness = job.lateness(now).unwrap_or_else(chrono::Duration::zero);
                warn!(
                    job_id = %job.id,
                    lateness_secs = lateness.num_seconds(),
                    grace_secs = job.misfire_grace_seconds,
                    "run missed its grace period, skipping"
                );
                DispatchOutcome::Misfired { lateness }
            } else {
                match InstanceGuard::acquire(&self.store, &job.id) {
                    Ok(guard) => {
                        debug!(job_id = %job.id, "dispatching job");
                        DispatchOutcome::Submitted(pool.submit(job.clone(), guard, Some(slot)))
                    }
                    Err(SchedulerError::Busy { running, .. }) => {
                        warn!(job_id = %job.id, running, max_instances = job.max_instances, "job still running, skipping this run");
                        DispatchOutcome::Busy
                    }
                    Err(e) => {
                        // Removed since the slot was claimed
                        debug!(job_id = %job.id, error = %e, "due job vanished");
                        continue;
                    }
                }
            };

            dispatched.push((job.id, outcome));
        }

        dispatched
    }

    /// Move a due job off `slot`. After a misfire, slots that would misfire
    /// too are skipped in one go.
    ///
    /// Returns false when the slot was no longer the job's next run, because
    /// another pass claimed it or the job was changed, paused or removed.
    fn advance(&self, job: &Job, slot: DateTime<Utc>, now: DateTime<Utc>, misfired: bool) -> bool {
        let mut from = slot;
        let mut skipped = 0u64;
        loop {
            match self.store.advance(&job.id, from) {
                Ok(Advanced::Next(next)) => {
                    let still_late = Job {
                        next_run_time: Some(next),
                        ..job.clone()
                    }
                    .is_misfire(now);
                    if misfired && still_late {
                        skipped += 1;
                        from = next;
                        continue;
                    }
                    debug!(job_id = %job.id, next_run_time = %next, skipped, "job advanced");
                    return true;
                }
                Ok(Advanced::Exhausted) => {
                    info!(job_id = %job.id, "job has no further runs");
                    return true;
                }
                Ok(Advanced::Superseded) => {
                    if skipped == 0 {
                        debug!(job_id = %job.id, slot = %slot, "slot superseded, not dispatching");
                    }
                    return skipped > 0;
                }
                Err(e) if e.is_not_found() => return false,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "failed to compute next run, unscheduling job");
                    return true;
                }
            }
        }
    }

    /// Swap in a fresh pool and shut the old one down.
    async fn retire_pool(&self, wait_timeout: Duration) -> ShutdownReport {
        let old_pool = {
            let mut pool = self.pool.write().await;
            std::mem::replace(&mut *pool, Arc::new(self.fresh_pool()))
        };
        old_pool.shutdown(wait_timeout).await
    }

    /// How long the loop may sleep before the next due job.
    fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        match self.store.next_wakeup() {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO).min(MAX_SLEEP),
            None => MAX_SLEEP,
        }
    }
}

fn spawn_loop(inner: Arc<Inner>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(run_loop(Arc::clone(&inner)))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            error!("scheduler loop panicked, stopping scheduler");
            inner.state_tx.send_replace(SchedulerState::Stopped);
            let report = inner.retire_pool(inner.config.shutdown_timeout()).await;
            info!(drained = report.drained, aborted = report.aborted, "scheduler stopped after loop fault");
        }
    })
}

async fn run_loop(inner: Arc<Inner>) {
    let mut state_rx = inner.state_tx.subscribe();
    info!("scheduler loop started");

    loop {
        let state = *state_rx.borrow_and_update();
        match state {
            SchedulerState::Stopped => break,
            SchedulerState::Paused => {
                if state_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            SchedulerState::Running => {}
        }

        inner.dispatch_due(inner.clock.now()).await;

        let sleep_duration = inner.sleep_duration(inner.clock.now());
        tokio::select! {
            biased;
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = inner.wake.notified() => {
                debug!("scheduler woken by job change");
            }
            _ = sleep(sleep_duration) => {}
        }
    }

    info!("scheduler loop stopped");
}

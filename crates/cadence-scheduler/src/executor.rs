//! Executor pool for job bodies.
//!
//! Every submission becomes a tokio task that first waits for one of
//! `max_workers` permits, then runs the body. Whatever happens to the body
//! (success, error, panic, cancellation or abort) its instance slot is
//! released and an [`ExecutionResult`] is recorded.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::{Semaphore, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::registry::{JobContext, JobRegistry};
use crate::results::ResultLog;
use crate::store::{InstanceGuard, JobStore};
use crate::{ExecutionResult, ExecutionStatus, Job};

/// Awaitable handle to one submitted execution.
#[derive(Debug)]
pub struct ExecutionHandle {
    job_id: String,
    rx: oneshot::Receiver<ExecutionResult>,
}

impl ExecutionHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Wait for the execution to finish.
    ///
    /// `None` if the run was dropped before its body started.
    pub async fn wait(self) -> Option<ExecutionResult> {
        self.rx.await.ok()
    }
}

/// How a pool shutdown went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Every task finished within the timeout.
    pub drained: bool,
    /// Tasks still running at the timeout and aborted.
    pub aborted: usize,
}

/// Bounded pool of running job bodies.
pub struct ExecutorPool {
    max_workers: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    cancel_tx: watch::Sender<bool>,
    in_flight: Arc<AtomicUsize>,
    registry: Arc<JobRegistry>,
    store: Arc<dyn JobStore>,
    results: Arc<ResultLog>,
    clock: Arc<dyn Clock>,
}

impl ExecutorPool {
    pub fn new(
        max_workers: usize,
        registry: Arc<JobRegistry>,
        store: Arc<dyn JobStore>,
        results: Arc<ResultLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            max_workers,
            permits: Arc::new(Semaphore::new(max_workers)),
            tasks: Mutex::new(JoinSet::new()),
            cancel_tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
            registry,
            store,
            results,
            clock,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Submitted runs that have not finished, including those waiting for a permit.
    pub fn running(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run `job` on the pool. The instance held by `guard` is released when the run ends.
    pub fn submit(
        &self,
        job: Job,
        guard: InstanceGuard,
        scheduled_for: Option<DateTime<Utc>>,
    ) -> ExecutionHandle {
        let (tx, rx) = oneshot::channel();
        let handle = ExecutionHandle {
            job_id: job.id.clone(),
            rx,
        };

        let body = self.registry.resolve_body(&job.body);
        let ctx = JobContext::new(&job, scheduled_for, self.cancel_tx.subscribe());
        let permits = Arc::clone(&self.permits);
        let mut run = Run {
            job_id: job.id,
            job_name: job.name,
            executed_at: None,
            started: Instant::now(),
            guard: Some(guard),
            in_flight: Arc::clone(&self.in_flight),
            store: Arc::clone(&self.store),
            results: Arc::clone(&self.results),
            clock: Arc::clone(&self.clock),
            finished: false,
        };
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let task = async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!(job_id = %run.job_id, "pool closed before run started");
                return;
            };
            if ctx.is_cancelled() {
                debug!(job_id = %run.job_id, "pool shutting down, run not started");
                return;
            }

            run.begin();
            let outcome = match body {
                Ok(body) => {
                    match AssertUnwindSafe(async move { body(ctx).await })
                        .catch_unwind()
                        .await
                    {
                        Ok(Ok(value)) => Outcome::Returned(value),
                        Ok(Err(e)) => Outcome::Failed(e.to_string()),
                        Err(panic) => Outcome::Panicked(panic_message(&*panic)),
                    }
                }
                Err(e) => Outcome::Failed(e.to_string()),
            };

            let result = run.finish(outcome);
            let _ = tx.send(result);
        };

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);

        handle
    }

    /// Signal cancellation, wait up to `timeout` for running bodies, then abort the rest.
    ///
    /// Runs still waiting for a permit never start.
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.cancel_tx.send_replace(true);
        self.permits.close();

        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };

        let drained = tokio::time::timeout(timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        let aborted = tasks.len();
        if aborted > 0 {
            warn!(aborted, "aborting job bodies still running after shutdown timeout");
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        info!(drained, aborted, "executor pool shut down");
        ShutdownReport { drained, aborted }
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("max_workers", &self.max_workers)
            .field("running", &self.running())
            .finish()
    }
}

/// How a body ended.
enum Outcome {
    Returned(Value),
    Failed(String),
    /// Carries the panic payload.
    Panicked(String),
}

/// Bookkeeping for one submitted run. Dropping it, even mid-body, settles the run.
struct Run {
    job_id: String,
    job_name: String,
    executed_at: Option<DateTime<Utc>>,
    started: Instant,
    guard: Option<InstanceGuard>,
    in_flight: Arc<AtomicUsize>,
    store: Arc<dyn JobStore>,
    results: Arc<ResultLog>,
    clock: Arc<dyn Clock>,
    finished: bool,
}

impl Run {
    fn begin(&mut self) {
        self.executed_at = Some(self.clock.now());
        self.started = Instant::now();
        debug!(job_id = %self.job_id, "job started");
    }

    fn finish(&mut self, outcome: Outcome) -> ExecutionResult {
        self.finished = true;
        let result = self.record(outcome);
        match &result.error {
            None => info!(job_id = %self.job_id, duration_ms = result.duration_ms, "job succeeded"),
            Some(e) => warn!(job_id = %self.job_id, error = %e, "job failed"),
        }
        result
    }

    fn record(&mut self, outcome: Outcome) -> ExecutionResult {
        // Free the slot before the result becomes visible
        self.guard.take();

        let (status, result, error, traceback) = match outcome {
            Outcome::Returned(value) => (ExecutionStatus::Success, Some(value), None, None),
            Outcome::Failed(e) => (ExecutionStatus::Error, None, Some(e), None),
            Outcome::Panicked(payload) => (
                ExecutionStatus::Error,
                None,
                Some("job panicked".to_string()),
                Some(payload),
            ),
        };
        let result = ExecutionResult {
            job_id: self.job_id.clone(),
            job_name: self.job_name.clone(),
            executed_at: self.executed_at.unwrap_or_else(|| self.clock.now()),
            status,
            result,
            error,
            traceback,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };

        // Results for deleted jobs are dropped
        if self.store.contains(&self.job_id) {
            self.results.record(result.clone());
            if !self.store.contains(&self.job_id) {
                self.results.purge(&self.job_id);
            }
        }
        result
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        if !self.finished && self.executed_at.is_some() {
            warn!(job_id = %self.job_id, "job aborted");
            self.record(Outcome::Failed("aborted during shutdown".to_string()));
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

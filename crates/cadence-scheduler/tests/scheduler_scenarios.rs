//! End-to-end scheduler scenarios.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use cadence_scheduler::{
    BodyError, Clock, CodeSandbox, DispatchOutcome, ExecutionStatus, JobBody, JobContext,
    JobPatch, JobRegistry, MAX_RESULTS_PER_JOB, ManualClock, MemoryJobStore, NewJob, SandboxError,
    Scheduler, SchedulerConfig, SchedulerError, SchedulerState, Trigger,
};

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

fn registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register("echo", "Return the kwargs", |ctx: JobContext| async move {
        Ok(Value::Object(ctx.kwargs))
    });
    registry.register("nap", "Sleep briefly", |ctx: JobContext| async move {
        ctx.sleep(Duration::from_millis(200)).await?;
        Ok(Value::Null)
    });
    registry.register("hang", "Ignore cancellation forever", |_ctx: JobContext| async {
        std::future::pending::<()>().await;
        Ok(Value::Null)
    });
    registry.register("fail", "Always fails", |_ctx: JobContext| async {
        Err(BodyError::Failed("nope".to_string()))
    });
    registry
}

fn manual_scheduler(clock: &Arc<ManualClock>) -> Scheduler {
    Scheduler::with_parts(
        SchedulerConfig::default(),
        registry(),
        Arc::new(MemoryJobStore::new()),
        Arc::clone(clock) as Arc<dyn Clock>,
    )
    .unwrap()
}

async fn wait_for_history(scheduler: &Scheduler, id: &str, count: usize) -> bool {
    for _ in 0..100 {
        if scheduler.job_history(id, None).len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn misfired_run_is_skipped_and_next_slot_kept() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(
            NewJob::new("report", Trigger::every_seconds(60), JobBody::function("echo"))
                .with_id("report")
                .with_misfire_grace_seconds(5),
        )
        .await
        .unwrap();

    // Scheduled for 60, the loop only gets to it at 70
    clock.set(t(70));
    let dispatched = scheduler.dispatch_due(clock.now()).await;

    assert_eq!(dispatched.len(), 1);
    assert!(matches!(dispatched[0].1, DispatchOutcome::Misfired { .. }));
    assert!(scheduler.job_history("report", None).is_empty());
    assert_eq!(scheduler.get_job("report").unwrap().next_run_time, Some(t(120)));
}

#[tokio::test]
async fn pause_and_resume_reanchor_interval() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    let job = scheduler
        .add_job(NewJob::new("tick", Trigger::every_seconds(60), JobBody::function("echo")).with_id("tick"))
        .await
        .unwrap();
    assert_eq!(job.next_run_time, Some(t(60)));

    clock.set(t(30));
    let paused = scheduler.pause_job("tick").await.unwrap();
    assert!(paused.paused);
    assert_eq!(paused.next_run_time, None);

    // Nothing fires while paused
    clock.set(t(90));
    assert!(scheduler.dispatch_due(clock.now()).await.is_empty());

    let resumed = scheduler.resume_job("tick").await.unwrap();
    assert_eq!(resumed.next_run_time, Some(t(150)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn manual_runs_respect_max_instances() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(
            NewJob::new("nap", Trigger::every_seconds(3_600), JobBody::function("nap"))
                .with_id("nap")
                .with_max_instances(2),
        )
        .await
        .unwrap();

    let first = scheduler.run_job_now("nap").await.unwrap();
    let second = scheduler.run_job_now("nap").await.unwrap();
    let third = scheduler.run_job_now("nap").await;
    assert!(matches!(
        third,
        Err(SchedulerError::Busy { running: 2, max_instances: 2, .. })
    ));
    assert_eq!(scheduler.scheduler_status().await.running_instances, 2);

    assert!(first.wait().await.unwrap().is_success());
    assert!(second.wait().await.unwrap().is_success());
    assert_eq!(scheduler.get_job("nap").unwrap().currently_running, 0);
    assert!(scheduler.run_job_now("nap").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn max_instances_cannot_drop_below_running_count() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(
            NewJob::new("hang", Trigger::every_seconds(3_600), JobBody::function("hang"))
                .with_id("hang")
                .with_max_instances(2),
        )
        .await
        .unwrap();
    let _first = scheduler.run_job_now("hang").await.unwrap();
    let _second = scheduler.run_job_now("hang").await.unwrap();

    let lower = JobPatch {
        max_instances: Some(1),
        ..Default::default()
    };
    assert!(matches!(
        scheduler.modify_job("hang", lower).await,
        Err(SchedulerError::InvalidConfig(_))
    ));

    let job = scheduler.get_job("hang").unwrap();
    assert_eq!(job.max_instances, 2);
    assert_eq!(job.currently_running, 2);
}

#[tokio::test]
async fn removing_a_job_drops_its_history() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    let new_job = NewJob::new("echo", Trigger::every_seconds(60), JobBody::function("echo"))
        .with_id("echo")
        .with_kwarg("n", json!(1));
    scheduler.add_job(new_job.clone()).await.unwrap();

    let result = scheduler.run_job_now("echo").await.unwrap().wait().await.unwrap();
    assert_eq!(result.result, Some(json!({ "n": 1 })));
    assert_eq!(scheduler.job_history("echo", None).len(), 1);

    scheduler.remove_job("echo").await.unwrap();
    assert!(scheduler.job_history("echo", None).is_empty());
    assert!(scheduler.get_job("echo").unwrap_err().is_not_found());

    // A new job under the same id starts with a clean slate
    scheduler.add_job(new_job).await.unwrap();
    assert!(scheduler.job_history("echo", None).is_empty());
}

#[tokio::test]
async fn history_keeps_the_latest_fifty() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(NewJob::new("echo", Trigger::every_seconds(60), JobBody::function("echo")).with_id("echo"))
        .await
        .unwrap();

    for n in 0..=MAX_RESULTS_PER_JOB as i64 {
        clock.set(t(n));
        scheduler.run_job_now("echo").await.unwrap().wait().await.unwrap();
    }

    let history = scheduler.job_history("echo", None);
    assert_eq!(history.len(), MAX_RESULTS_PER_JOB);
    assert_eq!(history.first().unwrap().executed_at, t(50));
    assert_eq!(history.last().unwrap().executed_at, t(1));
    assert_eq!(scheduler.job_history("echo", Some(3)).len(), 3);
}

#[tokio::test]
async fn failures_are_recorded_not_propagated() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(NewJob::new("fail", Trigger::every_seconds(60), JobBody::function("fail")).with_id("fail"))
        .await
        .unwrap();

    let result = scheduler.run_job_now("fail").await.unwrap().wait().await.unwrap();
    assert_eq!(result.status, ExecutionStatus::Error);
    assert_eq!(result.error.as_deref(), Some("nope"));
    assert_eq!(result.job_name, "fail");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_is_bounded_with_a_hanging_job() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(NewJob::new("hang", Trigger::every_seconds(3_600), JobBody::function("hang")).with_id("hang"))
        .await
        .unwrap();
    scheduler.scheduler_start().await;

    let handle = scheduler.run_job_now("hang").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let outcome = scheduler.scheduler_shutdown(Duration::from_millis(300)).await;
    assert!(outcome.is_applied());
    assert!(started.elapsed() < Duration::from_secs(3));

    assert!(handle.wait().await.is_none());
    assert_eq!(scheduler.state(), SchedulerState::Stopped);
    assert_eq!(scheduler.get_job("hang").unwrap().currently_running, 0);
    assert_eq!(scheduler.scheduler_status().await.running_instances, 0);

    // The pool was replaced; manual runs work again
    assert!(scheduler.run_job_now("hang").await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn running_loop_fires_due_jobs() {
    let scheduler = Scheduler::new(SchedulerConfig::default(), registry()).unwrap();
    scheduler
        .add_job(NewJob::new("tick", Trigger::every_seconds(1), JobBody::function("echo")).with_id("tick"))
        .await
        .unwrap();

    scheduler.scheduler_start().await;
    assert!(wait_for_history(&scheduler, "tick", 2).await);
    scheduler.scheduler_shutdown(Duration::from_secs(1)).await;

    let history = scheduler.job_history("tick", None);
    assert!(history.iter().all(|r| r.is_success()));
    assert!(history[0].executed_at > history[1].executed_at);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_pause_withholds_dispatch() {
    let scheduler = Scheduler::new(SchedulerConfig::default(), registry()).unwrap();
    scheduler.scheduler_start().await;
    scheduler.scheduler_pause().await;

    scheduler
        .add_job(NewJob::new("tick", Trigger::every_seconds(1), JobBody::function("echo")).with_id("tick"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(scheduler.job_history("tick", None).is_empty());

    // The overdue slot is within grace and fires on resume
    assert!(scheduler.scheduler_resume().await.is_applied());
    assert!(wait_for_history(&scheduler, "tick", 1).await);
    scheduler.scheduler_shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn modify_job_reschedules_from_now() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    scheduler
        .add_job(NewJob::new("tick", Trigger::every_seconds(60), JobBody::function("echo")).with_id("tick"))
        .await
        .unwrap();

    clock.set(t(10));
    let patch = JobPatch {
        name: Some("faster".to_string()),
        trigger: Some(Trigger::every_seconds(5)),
        ..Default::default()
    };
    let job = scheduler.modify_job("tick", patch).await.unwrap();
    assert_eq!(job.name, "faster");
    assert_eq!(job.next_run_time, Some(t(15)));

    let bad = JobPatch {
        trigger: Some(Trigger::at(t(0))),
        ..Default::default()
    };
    assert!(matches!(
        scheduler.modify_job("tick", bad).await,
        Err(SchedulerError::InvalidTrigger(_))
    ));
    assert_eq!(scheduler.get_job("tick").unwrap().next_run_time, Some(t(15)));
}

struct CountingSandbox {
    runs: AtomicUsize,
}

#[async_trait]
impl CodeSandbox for CountingSandbox {
    async fn run(&self, source: &str, ctx: &JobContext) -> Result<Value, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "len": source.len(), "args": ctx.args }))
    }
}

#[tokio::test]
async fn inline_code_runs_through_the_sandbox() {
    let sandbox = Arc::new(CountingSandbox {
        runs: AtomicUsize::new(0),
    });
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = Scheduler::with_parts(
        SchedulerConfig::default(),
        registry().with_sandbox(Arc::clone(&sandbox) as Arc<dyn CodeSandbox>),
        Arc::new(MemoryJobStore::new()),
        clock as Arc<dyn Clock>,
    )
    .unwrap();

    scheduler
        .add_job(
            NewJob::new("inline", Trigger::every_seconds(60), JobBody::code("result = 42;"))
                .with_id("inline")
                .with_args(vec![json!(1), json!(2)]),
        )
        .await
        .unwrap();

    let result = scheduler.run_job_now("inline").await.unwrap().wait().await.unwrap();
    assert_eq!(result.result, Some(json!({ "len": 11, "args": [1, 2] })));
    assert_eq!(sandbox.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);

    assert!(scheduler.get_job("ghost").unwrap_err().is_not_found());
    assert!(scheduler.remove_job("ghost").await.unwrap_err().is_not_found());
    assert!(scheduler.pause_job("ghost").await.unwrap_err().is_not_found());
    assert!(scheduler.resume_job("ghost").await.unwrap_err().is_not_found());
    assert!(scheduler.run_job_now("ghost").await.unwrap_err().is_not_found());
    assert!(scheduler.job_history("ghost", None).is_empty());
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let scheduler = manual_scheduler(&clock);
    let new_job = NewJob::new("a", Trigger::every_seconds(60), JobBody::function("echo")).with_id("a");

    scheduler.add_job(new_job.clone()).await.unwrap();
    assert!(matches!(
        scheduler.add_job(new_job).await,
        Err(SchedulerError::JobExists(_))
    ));
    assert_eq!(scheduler.list_jobs().len(), 1);
}

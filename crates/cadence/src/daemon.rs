//! Daemon mode: wire the registry, seed jobs and run the scheduler until a
//! shutdown signal arrives.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cadence_scheduler::{
    DenoSandbox, JobRegistry, NewJob, Scheduler, SchedulerConfig, SchedulerState,
    register_builtins,
};

/// Configuration for the daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub scheduler: SchedulerConfig,
    /// JSON file of jobs to add at startup.
    pub jobs_path: Option<PathBuf>,
    /// How often to log a status line.
    pub status_interval: Duration,
    /// Enable inline code jobs when Deno is available.
    pub sandbox: bool,
}

/// Build the scheduler config from an optional file plus command-line overrides.
pub fn load_config(
    path: Option<&Path>,
    max_workers: Option<usize>,
    shutdown_timeout: Option<u64>,
) -> Result<SchedulerConfig> {
    let mut config = match path {
        Some(path) => SchedulerConfig::from_file(path)
            .map_err(|e| miette::miette!("failed to load {}: {}", path.display(), e))?,
        None => SchedulerConfig::default(),
    };

    if let Some(max_workers) = max_workers {
        config.max_workers = max_workers;
    }
    if let Some(secs) = shutdown_timeout {
        config.shutdown_timeout_secs = secs;
    }

    config
        .validate()
        .map_err(|e| miette::miette!("invalid configuration: {}", e))?;
    Ok(config)
}

/// Read seed jobs from a JSON array.
pub fn load_jobs(path: &Path) -> Result<Vec<NewJob>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("failed to read {}: {}", path.display(), e))?;
    serde_json::from_str(&raw)
        .map_err(|e| miette::miette!("failed to parse {}: {}", path.display(), e))
}

/// Registry with the built-in functions and, when enabled and installed, the Deno sandbox.
pub async fn build_registry(sandbox: bool) -> JobRegistry {
    let mut registry = JobRegistry::new();
    register_builtins(&mut registry);

    if !sandbox {
        info!("inline code jobs disabled");
        return registry;
    }

    if DenoSandbox::is_available().await {
        info!("Deno sandbox available for inline code jobs");
        registry.with_sandbox(Arc::new(DenoSandbox::default()))
    } else {
        warn!("Deno not found, inline code jobs will be rejected");
        registry
    }
}

/// Run the daemon.
pub async fn run(config: DaemonConfig) -> Result<()> {
    info!("starting cadence daemon");

    let registry = build_registry(config.sandbox).await;
    let scheduler = Scheduler::new(config.scheduler.clone(), registry)
        .map_err(|e| miette::miette!("{}", e))?;

    if let Some(path) = &config.jobs_path {
        for new_job in load_jobs(path)? {
            let name = new_job.name.clone();
            let job = scheduler
                .add_job(new_job)
                .await
                .map_err(|e| miette::miette!("failed to add job {}: {}", name, e))?;
            info!(job_id = %job.id, name = %job.name, next_run_time = ?job.next_run_time, "seeded job");
        }
    }

    scheduler.scheduler_start().await;

    // Handle shutdown signals
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let supervised = supervise(&scheduler, shutdown_rx, config.status_interval).await;

    scheduler
        .scheduler_shutdown(config.scheduler.shutdown_timeout())
        .await;
    info!("cadence daemon stopped");
    supervised
}

/// Log status until a shutdown signal arrives.
///
/// Fails if the scheduler stops on its own.
pub async fn supervise(
    scheduler: &Scheduler,
    mut shutdown_rx: watch::Receiver<bool>,
    status_interval: Duration,
) -> Result<()> {
    let mut state_rx = scheduler.subscribe_state();
    let mut status_tick = tokio::time::interval(status_interval);

    loop {
        if *state_rx.borrow_and_update() == SchedulerState::Stopped {
            error!("scheduler stopped unexpectedly");
            return Err(miette::miette!("scheduler stopped unexpectedly"));
        }

        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return Ok(());
                }
            }

            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Err(miette::miette!("scheduler dropped"));
                }
            }

            _ = status_tick.tick() => {
                let status = scheduler.scheduler_status().await;
                info!(
                    state = %status.state,
                    jobs = status.job_count,
                    running = status.running_instances,
                    next_wakeup = ?status.next_wakeup,
                    "scheduler status"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_apply_over_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_workers": 4, "shutdown_timeout_secs": 10}}"#).unwrap();

        let config = load_config(Some(file.path()), Some(8), None).unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.shutdown_timeout_secs, 10);
        assert_eq!(config.default_misfire_grace_seconds, 30);
    }

    #[test]
    fn test_out_of_range_override_rejected() {
        assert!(load_config(None, Some(101), None).is_err());
        assert!(load_config(None, Some(0), None).is_err());
        assert!(load_config(None, Some(100), None).is_ok());
    }

    #[test]
    fn test_load_jobs() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"id": "tick", "name": "Tick", "trigger": {{"type": "interval", "minutes": 5}},
                  "body": {{"kind": "function", "id": "sample_job"}}}},
                {{"name": "Nightly backup", "trigger": {{"type": "cron", "hour": 2, "minute": 0}},
                  "body": {{"kind": "function", "id": "backup_database"}},
                  "kwargs": {{"database_name": "orders"}}, "max_instances": 1}}
            ]"#
        )
        .unwrap();

        let jobs = load_jobs(file.path()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id.as_deref(), Some("tick"));
        assert_eq!(jobs[1].max_instances, Some(1));
    }

    #[tokio::test]
    async fn test_registry_without_sandbox() {
        let registry = build_registry(false).await;
        assert!(!registry.has_sandbox());
        assert!(registry.contains("sample_job"));
    }

    #[tokio::test]
    async fn test_supervise_returns_on_shutdown_signal() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), JobRegistry::new()).unwrap();
        scheduler.scheduler_start().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).unwrap();

        let supervised = supervise(&scheduler, shutdown_rx, Duration::from_secs(60)).await;
        assert!(supervised.is_ok());
        scheduler.scheduler_shutdown(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_supervise_fails_when_scheduler_stops() {
        let scheduler = Scheduler::new(SchedulerConfig::default(), JobRegistry::new()).unwrap();
        scheduler.scheduler_start().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let stopper = scheduler.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.scheduler_shutdown(Duration::from_millis(50)).await;
        });

        let supervised = tokio::time::timeout(
            Duration::from_secs(5),
            supervise(&scheduler, shutdown_rx, Duration::from_secs(60)),
        )
        .await
        .unwrap();
        assert!(supervised.is_err());
    }
}

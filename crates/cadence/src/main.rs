//! Cadence: in-process job scheduler daemon
//!
//! Main binary with subcommands:
//! - `run`: Run the scheduler until interrupted
//! - `functions`: List the job functions jobs can call
//! - `preview`: Show upcoming fire times for a trigger

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_scheduler::Trigger;

mod daemon;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "In-process job scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run {
        /// Scheduler config file (JSON)
        #[arg(long, env = "CADENCE_CONFIG")]
        config: Option<PathBuf>,

        /// Jobs to add at startup (JSON array of job definitions)
        #[arg(long, env = "CADENCE_JOBS")]
        jobs: Option<PathBuf>,

        /// Global ceiling on concurrently running job bodies (1-100)
        #[arg(long, env = "CADENCE_MAX_WORKERS")]
        max_workers: Option<usize>,

        /// Seconds to wait for running jobs on shutdown before aborting them
        #[arg(long, env = "CADENCE_SHUTDOWN_TIMEOUT")]
        shutdown_timeout: Option<u64>,

        /// Seconds between status log lines
        #[arg(long, env = "CADENCE_STATUS_INTERVAL", default_value = "300")]
        status_interval: u64,

        /// Don't run inline code jobs, even if Deno is installed
        #[arg(long)]
        no_sandbox: bool,
    },

    /// List the functions jobs can call
    Functions,

    /// Print the next fire times of a trigger
    Preview {
        /// Trigger definition, e.g. '{"type":"cron","minute":"*/15"}'
        trigger: String,

        /// How many fire times to print
        #[arg(long, default_value = "5")]
        count: usize,

        /// Start from this RFC 3339 time instead of now
        #[arg(long)]
        from: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            jobs,
            max_workers,
            shutdown_timeout,
            status_interval,
            no_sandbox,
        } => {
            let scheduler =
                daemon::load_config(config.as_deref(), max_workers, shutdown_timeout)?;
            daemon::run(daemon::DaemonConfig {
                scheduler,
                jobs_path: jobs,
                status_interval: std::time::Duration::from_secs(status_interval.max(1)),
                sandbox: !no_sandbox,
            })
            .await
        }

        Commands::Functions => {
            let registry = cadence_scheduler::builtin_registry();
            for function in registry.list_functions() {
                println!("{:<20} {}", function.id, function.description);
            }
            Ok(())
        }

        Commands::Preview {
            trigger,
            count,
            from,
        } => preview(&trigger, count, from.unwrap_or_else(Utc::now)),
    }
}

fn preview(trigger: &str, count: usize, from: DateTime<Utc>) -> Result<()> {
    let trigger: Trigger =
        serde_json::from_str(trigger).map_err(|e| miette::miette!("invalid trigger: {}", e))?;

    println!("{trigger}");
    let mut next = Some(
        trigger
            .first_fire(from)
            .map_err(|e| miette::miette!("{}", e))?,
    );
    for _ in 0..count {
        let Some(at) = next else {
            println!("(no further runs)");
            break;
        };
        println!("{}", at.to_rfc3339());
        next = trigger
            .next_fire(at)
            .map_err(|e| miette::miette!("{}", e))?;
    }

    Ok(())
}

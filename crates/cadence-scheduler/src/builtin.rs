//! Built-in job functions.
//!
//! These simulate typical maintenance work with a short cancellable sleep and
//! return a JSON summary, so a fresh scheduler has something to run.

use std::time::Duration;

use chrono::Utc;
use serde_json::{Value, json};
use tracing::info;

use crate::registry::{BodyError, JobContext, JobRegistry};

/// Register every built-in function on `registry`.
pub fn register_builtins(registry: &mut JobRegistry) {
    registry.register("sample_job", "Log a message and echo it back", sample_job);
    registry.register("send_email", "Simulate sending an email", send_email);
    registry.register("backup_database", "Simulate a database backup", backup_database);
    registry.register("process_data", "Simulate processing a batch of records", process_data);
}

/// A registry with the built-ins already registered.
pub fn builtin_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    register_builtins(&mut registry);
    registry
}

async fn sample_job(ctx: JobContext) -> Result<Value, BodyError> {
    let message = ctx.str_arg(0, "message", Some("Hello from cadence!"))?;
    info!(job_id = %ctx.job_id, message = %message, "executing sample job");
    ctx.sleep(Duration::from_secs(1)).await?;

    Ok(json!({
        "status": "completed",
        "message": message,
        "timestamp": Utc::now(),
    }))
}

async fn send_email(ctx: JobContext) -> Result<Value, BodyError> {
    let recipient = ctx.str_arg(0, "recipient", None)?;
    let subject = ctx.str_arg(1, "subject", None)?;
    let body = ctx.str_arg(2, "body", Some(""))?;
    info!(job_id = %ctx.job_id, recipient = %recipient, "sending email");
    ctx.sleep(Duration::from_secs(2)).await?;

    Ok(json!({
        "status": "sent",
        "recipient": recipient,
        "subject": subject,
        "body_bytes": body.len(),
        "sent_at": Utc::now(),
    }))
}

async fn backup_database(ctx: JobContext) -> Result<Value, BodyError> {
    let database = ctx.str_arg(0, "database_name", Some("main_db"))?;
    info!(job_id = %ctx.job_id, database = %database, "starting backup");
    ctx.sleep(Duration::from_secs(5)).await?;

    let finished = Utc::now();
    Ok(json!({
        "status": "completed",
        "database": database,
        "backup_location": format!("/backups/{database}_{}.sql", finished.format("%Y%m%d_%H%M%S")),
        "completed_at": finished,
    }))
}

async fn process_data(ctx: JobContext) -> Result<Value, BodyError> {
    let records = ctx.u64_arg(0, "records_count", 1000)?;
    info!(job_id = %ctx.job_id, records, "processing records");
    ctx.sleep(Duration::from_secs(3)).await?;

    Ok(json!({
        "status": "processed",
        "records_processed": records,
        "completed_at": Utc::now(),
    }))
}

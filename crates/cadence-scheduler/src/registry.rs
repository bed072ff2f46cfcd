//! Registry of callable job bodies.
//!
//! Jobs never hold code directly. They name a function id (or carry inline
//! source for the sandbox) and the registry turns that into a [`JobFn`] when
//! the job fires.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::watch;

use crate::sandbox::SandboxError;
use crate::{Job, JobBody, Kwargs, SchedulerError};

/// Failure of a job body. Recorded as an error result, never propagated.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("missing argument: {0}")]
    MissingArgument(String),

    #[error("invalid argument {name}: {reason}")]
    InvalidArgument { name: String, reason: String },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("{0}")]
    Failed(String),
}

/// Boxed future returned by a job body.
pub type BodyFuture = Pin<Box<dyn Future<Output = Result<Value, BodyError>> + Send>>;

/// A resolved, callable job body.
pub type JobFn = Arc<dyn Fn(JobContext) -> BodyFuture + Send + Sync>;

/// Everything a body sees about the run it belongs to.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub job_name: String,
    pub args: Vec<Value>,
    pub kwargs: Kwargs,
    /// The slot this run was dispatched for; `None` for manual runs.
    pub scheduled_for: Option<DateTime<Utc>>,
    cancel: watch::Receiver<bool>,
}

impl JobContext {
    pub fn new(job: &Job, scheduled_for: Option<DateTime<Utc>>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            job_id: job.id.clone(),
            job_name: job.name.clone(),
            args: job.args.clone(),
            kwargs: job.kwargs.clone(),
            scheduled_for,
            cancel,
        }
    }

    /// Whether shutdown has asked running bodies to stop.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once cancellation is requested or the pool is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.clone();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: std::time::Duration) -> Result<(), BodyError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(BodyError::Cancelled),
        }
    }

    /// Argument by keyword, falling back to its position in `args`.
    pub fn arg(&self, position: usize, name: &str) -> Option<&Value> {
        self.kwargs.get(name).or_else(|| self.args.get(position))
    }

    /// String argument, or `default` when absent.
    pub fn str_arg(&self, position: usize, name: &str, default: Option<&str>) -> Result<String, BodyError> {
        match self.arg(position, name) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Err(BodyError::InvalidArgument {
                name: name.to_string(),
                reason: format!("expected a string, got {other}"),
            }),
            None => default
                .map(str::to_string)
                .ok_or_else(|| BodyError::MissingArgument(name.to_string())),
        }
    }

    /// Non-negative integer argument, or `default` when absent.
    pub fn u64_arg(&self, position: usize, name: &str, default: u64) -> Result<u64, BodyError> {
        match self.arg(position, name) {
            None => Ok(default),
            Some(value) => value.as_u64().ok_or_else(|| BodyError::InvalidArgument {
                name: name.to_string(),
                reason: format!("expected a non-negative integer, got {value}"),
            }),
        }
    }

    /// The JSON view of this run handed to sandboxed code.
    pub fn to_json(&self) -> Value {
        json!({
            "job_id": self.job_id,
            "job_name": self.job_name,
            "scheduled_for": self.scheduled_for,
        })
    }
}

/// Runs inline job source in isolation.
#[async_trait]
pub trait CodeSandbox: Send + Sync {
    async fn run(&self, source: &str, ctx: &JobContext) -> Result<Value, SandboxError>;
}

/// A registered function as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionInfo {
    pub id: String,
    pub description: String,
}

struct Registered {
    description: String,
    body: JobFn,
}

/// Maps function ids to job bodies.
#[derive(Default)]
pub struct JobRegistry {
    functions: HashMap<String, Registered>,
    sandbox: Option<Arc<dyn CodeSandbox>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `id`, replacing any previous registration.
    pub fn register<F, Fut>(&mut self, id: impl Into<String>, description: impl Into<String>, body: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BodyError>> + Send + 'static,
    {
        let callable: JobFn = Arc::new(move |ctx: JobContext| -> BodyFuture { Box::pin(body(ctx)) });
        self.functions.insert(
            id.into(),
            Registered {
                description: description.into(),
                body: callable,
            },
        );
    }

    /// Enable inline code bodies.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn CodeSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn has_sandbox(&self) -> bool {
        self.sandbox.is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    pub fn resolve(&self, id: &str) -> Result<JobFn, SchedulerError> {
        self.functions
            .get(id)
            .map(|registered| Arc::clone(&registered.body))
            .ok_or_else(|| SchedulerError::UnknownFunction(id.to_string()))
    }

    /// Resolve whatever a job body names into something callable.
    pub fn resolve_body(&self, body: &JobBody) -> Result<JobFn, SchedulerError> {
        match body {
            JobBody::Function { id } => self.resolve(id),
            JobBody::Code { source } => {
                let sandbox = self.sandbox.clone().ok_or_else(|| {
                    SchedulerError::Sandbox("no code sandbox configured".to_string())
                })?;
                let source: Arc<str> = Arc::from(source.as_str());
                Ok(Arc::new(move |ctx: JobContext| -> BodyFuture {
                    let sandbox = Arc::clone(&sandbox);
                    let source = Arc::clone(&source);
                    Box::pin(async move { Ok(sandbox.run(&source, &ctx).await?) })
                }))
            }
        }
    }

    /// Registered functions sorted by id.
    pub fn list_functions(&self) -> Vec<FunctionInfo> {
        let mut functions: Vec<FunctionInfo> = self
            .functions
            .iter()
            .map(|(id, registered)| FunctionInfo {
                id: id.clone(),
                description: registered.description.clone(),
            })
            .collect();
        functions.sort_by(|a, b| a.id.cmp(&b.id));
        functions
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.functions.keys().collect();
        ids.sort();
        f.debug_struct("JobRegistry")
            .field("functions", &ids)
            .field("sandbox", &self.sandbox.is_some())
            .finish()
    }
}

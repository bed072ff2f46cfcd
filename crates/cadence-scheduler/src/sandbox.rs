//! Deno sandbox for inline job code.
//!
//! Inline source runs in a Deno subprocess with no permissions, an empty
//! environment and a timeout. The source is the body of an async function
//! that sees `args`, `kwargs` and `context` and assigns `result`:
//!
//! ```javascript
//! const total = args.reduce((a, b) => a + b, 0);
//! result = { total, who: kwargs.name ?? context.job_name };
//! ```

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::registry::{CodeSandbox, JobContext};

/// Default limit on one sandboxed run.
pub const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from sandboxed execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("execution timeout after {0}ms")]
    Timeout(u64),

    #[error("code execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Deno not found - is Deno installed?")]
    DenoNotFound,

    #[error("invalid sandbox output: {0}")]
    InvalidOutput(String),

    #[error("cancelled")]
    Cancelled,
}

/// Runs inline JavaScript in a locked-down Deno process.
#[derive(Debug, Clone)]
pub struct DenoSandbox {
    timeout: Duration,
}

impl Default for DenoSandbox {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SANDBOX_TIMEOUT,
        }
    }
}

impl DenoSandbox {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Check if Deno is available on the system.
    pub async fn is_available() -> bool {
        Command::new("deno")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn execute(&self, source: &str, input: &Value) -> Result<Value, SandboxError> {
        let start = Instant::now();

        let script = NamedTempFile::with_suffix(".js")?;
        tokio::fs::write(script.path(), wrap_source(source)).await?;

        let mut cmd = Command::new("deno");
        cmd.arg("run").arg("--no-prompt").arg("--quiet").arg(script.path());

        // Nothing is inherited beyond what Deno itself needs to start
        cmd.env_clear();
        cmd.env("DENO_NO_UPDATE_CHECK", "1");
        for key in ["PATH", "HOME", "DENO_DIR"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(script = %script.path().display(), "running sandboxed code");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::DenoNotFound
            } else {
                SandboxError::Io(e)
            }
        })?;

        let input_json = serde_json::to_string(input)?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input_json.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| SandboxError::Timeout(self.timeout.as_millis() as u64))??;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            warn!(
                exit_code = ?output.status.code(),
                stderr = %stderr,
                "sandboxed code failed"
            );
            return Err(SandboxError::ExecutionFailed(stderr.into_owned()));
        }

        // Code may log freely; the wrapper's verdict is always the last line
        let verdict = stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| SandboxError::InvalidOutput("no output".to_string()))?;
        let verdict: Verdict = serde_json::from_str(verdict).map_err(|e| {
            SandboxError::InvalidOutput(format!("{e} (stdout: {stdout})"))
        })?;

        debug!(duration_ms = start.elapsed().as_millis() as u64, "sandboxed code finished");

        if verdict.success {
            Ok(verdict.result.unwrap_or(Value::Null))
        } else {
            Err(SandboxError::ExecutionFailed(
                verdict.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

#[async_trait]
impl CodeSandbox for DenoSandbox {
    async fn run(&self, source: &str, ctx: &JobContext) -> Result<Value, SandboxError> {
        let input = json!({
            "args": ctx.args,
            "kwargs": ctx.kwargs,
            "context": ctx.to_json(),
        });

        // Dropping the execution future kills the child process
        tokio::select! {
            outcome = self.execute(source, &input) => outcome,
            _ = ctx.cancelled() => Err(SandboxError::Cancelled),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Verdict {
    success: bool,
    result: Option<Value>,
    error: Option<String>,
}

fn wrap_source(source: &str) -> String {
    format!(
        r#"
const {{ args, kwargs, context }} = JSON.parse(await new Response(Deno.stdin.readable).text());

try {{
    const value = await (async (args, kwargs, context) => {{
        let result = null;
{source}
        return result;
    }})(args, kwargs, context);
    console.log("\n" + JSON.stringify({{ success: true, result: value ?? null }}));
}} catch (error) {{
    console.log("\n" + JSON.stringify({{ success: false, error: error?.message ?? String(error) }}));
}}
"#
    )
}

//! Subprocess sandbox: `program args... <unit source>`, input JSON on stdin, result JSON on stdout.

use std::process::Stdio;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;
use vigil_core::ExecutionContext;

use crate::{Sandbox, SandboxFault, WrappedUnit};

#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    program: String,
    args: Vec<String>,
}

impl ProcessSandbox {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }

    /// `node -e <unit>`
    pub fn node() -> Self { Self::new("node", ["-e"]) }

    pub fn program(&self) -> &str { &self.program }
}

#[async_trait::async_trait]
impl Sandbox for ProcessSandbox {
    async fn run(&self, unit: &WrappedUnit, input: &Value, ctx: &ExecutionContext) -> Result<Option<Value>, SandboxFault> {
        let body = serde_json::to_vec(input).map_err(|e| SandboxFault::Runtime(format!("encoding unit input: {}", e)))?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(&unit.source)
            .env("VIGIL_EXECUTION_ID", ctx.execution_id.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // dropping the future (timeout, cancellation) kills the child
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxFault::Runtime(format!("spawning {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // a unit that exits without reading its input is judged by its exit status
            if let Err(e) = stdin.write_all(&body).await {
                debug!(execution_id = %ctx.execution_id, error = %e, "unit stdin write failed");
            }
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SandboxFault::Runtime(format!("waiting for unit: {}", e)))?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!(execution_id = %ctx.execution_id, stderr = %stderr.trim(), "unit stderr");
        }
        if !output.status.success() {
            return Err(SandboxFault::Runtime(format!("unit exited with {}: {}", output.status, exit_reason(&stderr))));
        }
        parse_unit_output(&output.stdout)
    }
}

const STDERR_TAIL_LINES: usize = 3;
const STDERR_TAIL_BYTES: usize = 512;

/// The first `SomethingError: ...` line, else a bounded tail of stderr.
pub(crate) fn exit_reason(stderr: &str) -> String {
    if let Some(line) = stderr.lines().map(str::trim).find(|l| is_error_line(l)) {
        return line.to_string();
    }
    let lines: Vec<&str> = stderr.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join(" | ");
    if tail.len() <= STDERR_TAIL_BYTES {
        return tail;
    }
    let mut cut = tail.len() - STDERR_TAIL_BYTES;
    while !tail.is_char_boundary(cut) {
        cut += 1;
    }
    format!("...{}", &tail[cut..])
}

/// `^\w*Error\b`: `Error: x`, `SyntaxError: x`, `TypeError [ERR_X]: x`.
fn is_error_line(line: &str) -> bool {
    let word_len = line.find(|c: char| !(c.is_alphanumeric() || c == '_')).unwrap_or(line.len());
    line[..word_len].ends_with("Error")
}

/// Empty stdout means the unit returned nothing.
pub(crate) fn parse_unit_output(stdout: &[u8]) -> Result<Option<Value>, SandboxFault> {
    let text = std::str::from_utf8(stdout).map_err(|e| SandboxFault::Runtime(format!("unit output is not UTF-8: {}", e)))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| SandboxFault::Runtime(format!("unit output is not JSON: {}", e)))
}

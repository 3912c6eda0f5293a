//! Vigil provider client: control-plane calls against an external provider.
//!
//! A call returns the provider's raw stdout; parsing belongs to the caller. Calls are
//! cancellable by dropping their future (the child process is killed on drop).

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// One provider operation, e.g. `eks list-clusters --region us-east-1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCall {
    pub service: String,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl ProviderCall {
    pub fn new(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self { service: service.into(), operation: operation.into(), args: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    /// `service operation`, used as a short key in logs and metrics.
    pub fn key(&self) -> String { format!("{} {}", self.service, self.operation) }
}

impl std::fmt::Display for ProviderCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.service, self.operation)?;
        for a in &self.args {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

/// Where and as whom provider calls run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderContext {
    pub region: String,
    /// Extra environment for the provider process (credentials and the like).
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ProviderContext {
    pub fn aws(access_key_id: &str, secret_access_key: &str, region: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert("AWS_ACCESS_KEY_ID".to_string(), access_key_id.to_string());
        env.insert("AWS_SECRET_ACCESS_KEY".to_string(), secret_access_key.to_string());
        env.insert("AWS_DEFAULT_REGION".to_string(), region.to_string());
        Self { region: region.to_string(), env }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{call} exited with {status}: {stderr}")]
    Failed { call: String, status: String, stderr: String },
    #[error("no scripted response for {0}")]
    Unscripted(String),
}

/// Transport to a provider's control plane.
#[async_trait::async_trait]
pub trait ProviderClient: Send + Sync {
    async fn call(&self, call: &ProviderCall, env: &BTreeMap<String, String>) -> Result<String, ProviderError>;
}

/// Runs the provider's CLI: `program service operation args...`.
#[derive(Debug, Clone)]
pub struct CliProvider {
    program: String,
}

impl CliProvider {
    pub fn new(program: impl Into<String>) -> Self { Self { program: program.into() } }

    pub fn aws() -> Self { Self::new("aws") }
}

#[async_trait::async_trait]
impl ProviderClient for CliProvider {
    async fn call(&self, call: &ProviderCall, env: &BTreeMap<String, String>) -> Result<String, ProviderError> {
        let t0 = Instant::now();
        debug!(program = %self.program, call = %call, "provider call start");
        let output = Command::new(&self.program)
            .arg(&call.service)
            .arg(&call.operation)
            .args(&call.args)
            .envs(env)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProviderError::Spawn { program: self.program.clone(), source })?;
        histogram!("provider_call_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if !output.status.success() {
            counter!("provider_call_errors", 1, "call" => call.key());
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(call = %call, status = %output.status, stderr = %stderr, "provider call failed");
            return Err(ProviderError::Failed { call: call.to_string(), status: output.status.to_string(), stderr });
        }
        counter!("provider_calls", 1, "call" => call.key());
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Scripted provider for tests: responses are queued per `service operation` key and
/// served in FIFO order. Every call is recorded.
#[derive(Debug, Default)]
pub struct MockProvider {
    responses: Mutex<HashMap<String, VecDeque<Result<String, String>>>>,
    calls: Mutex<Vec<ProviderCall>>,
}

impl MockProvider {
    pub fn new() -> Self { Self::default() }

    pub fn respond(self, key: &str, stdout: impl Into<String>) -> Self {
        self.push(key, Ok(stdout.into()));
        self
    }

    pub fn fail(self, key: &str, stderr: impl Into<String>) -> Self {
        self.push(key, Err(stderr.into()));
        self
    }

    fn push(&self, key: &str, r: Result<String, String>) {
        let mut map = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().push_back(r);
    }

    pub fn calls(&self) -> Vec<ProviderCall> { self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone() }
}

#[async_trait::async_trait]
impl ProviderClient for MockProvider {
    async fn call(&self, call: &ProviderCall, _env: &BTreeMap<String, String>) -> Result<String, ProviderError> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call.clone());
        let next = {
            let mut map = self.responses.lock().unwrap_or_else(|e| e.into_inner());
            map.get_mut(&call.key()).and_then(|q| q.pop_front())
        };
        match next {
            Some(Ok(stdout)) => Ok(stdout),
            Some(Err(stderr)) => Err(ProviderError::Failed { call: call.to_string(), status: "exit status: 255".into(), stderr }),
            None => Err(ProviderError::Unscripted(call.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_renders_service_operation_and_args() {
        let c = ProviderCall::new("eks", "describe-cluster").arg("--region").arg("us-east-1").arg("--name").arg("a");
        assert_eq!(c.to_string(), "eks describe-cluster --region us-east-1 --name a");
        assert_eq!(c.key(), "eks describe-cluster");
    }

    #[test]
    fn aws_context_exports_credentials() {
        let cx = ProviderContext::aws("AKIA", "secret", "eu-west-1");
        assert_eq!(cx.region, "eu-west-1");
        assert_eq!(cx.env.get("AWS_ACCESS_KEY_ID").map(String::as_str), Some("AKIA"));
        assert_eq!(cx.env.get("AWS_DEFAULT_REGION").map(String::as_str), Some("eu-west-1"));
    }

    #[tokio::test]
    async fn mock_serves_fifo_and_records_calls() {
        let p = MockProvider::new().respond("eks describe-cluster", "1").respond("eks describe-cluster", "2");
        let c = ProviderCall::new("eks", "describe-cluster");
        let env = BTreeMap::new();
        assert_eq!(p.call(&c, &env).await.unwrap(), "1");
        assert_eq!(p.call(&c, &env).await.unwrap(), "2");
        assert!(matches!(p.call(&c, &env).await, Err(ProviderError::Unscripted(_))));
        assert_eq!(p.calls().len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_provider_passes_argv_and_env() {
        // `sh -c <script> <$0> <$1>`
        let p = CliProvider::new("sh");
        let call = ProviderCall::new("-c", "printf '%s:%s' \"$VIGIL_TEST_REGION\" \"$1\"").arg("zero").arg("one");
        let mut env = BTreeMap::new();
        env.insert("VIGIL_TEST_REGION".to_string(), "us-east-1".to_string());
        let out = p.call(&call, &env).await.unwrap();
        assert_eq!(out, "us-east-1:one");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cli_provider_reports_non_zero_exit() {
        let p = CliProvider::new("sh");
        let call = ProviderCall::new("-c", "echo denied >&2; exit 255");
        match p.call(&call, &BTreeMap::new()).await {
            Err(ProviderError::Failed { stderr, .. }) => assert_eq!(stderr, "denied"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

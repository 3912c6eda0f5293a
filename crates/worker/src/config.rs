//! Worker configuration from `VIGIL_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Applied when an action-run request carries no `timeoutMs`.
    pub default_timeout: Duration,
    /// Upper bound on one whole discovery pass.
    pub discovery_timeout: Duration,
    pub max_concurrency: usize,
    /// Capacity of the request and response channels in the serve loop.
    pub queue_cap: usize,
    pub sandbox_program: String,
    pub sandbox_args: Vec<String>,
    pub provider_bin: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_millis(60_000),
            discovery_timeout: Duration::from_millis(300_000),
            max_concurrency: 16,
            queue_cap: 1024,
            sandbox_program: "node".to_string(),
            sandbox_args: vec!["-e".to_string()],
            provider_bin: "aws".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|key| std::env::var(key).ok()) }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            default_timeout: Duration::from_millis(parsed(&lookup, "VIGIL_DEFAULT_TIMEOUT_MS", d.default_timeout.as_millis() as u64)),
            discovery_timeout: Duration::from_millis(parsed(&lookup, "VIGIL_DISCOVERY_TIMEOUT_MS", d.discovery_timeout.as_millis() as u64)),
            max_concurrency: parsed(&lookup, "VIGIL_MAX_CONCURRENCY", d.max_concurrency).max(1),
            queue_cap: parsed(&lookup, "VIGIL_QUEUE_CAP", d.queue_cap).max(1),
            sandbox_program: lookup("VIGIL_SANDBOX_PROGRAM").filter(|s| !s.is_empty()).unwrap_or(d.sandbox_program),
            sandbox_args: lookup("VIGIL_SANDBOX_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(d.sandbox_args),
            provider_bin: lookup("VIGIL_PROVIDER_BIN").filter(|s| !s.is_empty()).unwrap_or(d.provider_bin),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = %raw, "invalid config value; using default");
            default
        }),
    }
}

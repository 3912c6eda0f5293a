//! Vigil sandbox: wrapped units, the sandbox port, and wall-clock enforcement.
//!
//! The isolation mechanism lives behind [`Sandbox`]; this crate only owns the calling
//! contract. [`execute`] always returns by the deadline, even when the underlying work
//! cannot be stopped.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, warn};
use vigil_core::ExecutionContext;

pub mod inproc;
pub mod process;
pub mod wrap;

pub use inproc::InProcessSandbox;
pub use process::ProcessSandbox;
pub use wrap::{wrap, UnitContext, WrapError, WrappedUnit};

#[derive(Debug, thiserror::Error)]
pub enum SandboxFault {
    #[error("execution timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("{0}")]
    Runtime(String),
}

impl SandboxFault {
    /// Short label for logs and metrics; the wire protocol does not distinguish these.
    pub fn label(&self) -> &'static str {
        match self {
            SandboxFault::Timeout(_) => "timeout",
            SandboxFault::Runtime(_) => "runtime",
        }
    }
}

/// Port for running a wrapped unit inside an isolation boundary.
#[async_trait::async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `unit` with `input`. `Ok(None)` means the unit produced no value at all.
    async fn run(&self, unit: &WrappedUnit, input: &Value, ctx: &ExecutionContext) -> Result<Option<Value>, SandboxFault>;
}

/// Run a unit under a hard wall-clock bound.
///
/// The run happens on its own task; on expiry the task is aborted and the caller gets
/// [`SandboxFault::Timeout`] immediately. Blocking work inside the sandbox may outlive
/// the call, but its result is never surfaced.
pub async fn execute(
    sandbox: Arc<dyn Sandbox>,
    unit: WrappedUnit,
    input: Value,
    timeout: Duration,
    ctx: ExecutionContext,
) -> Result<Option<Value>, SandboxFault> {
    let t0 = Instant::now();
    let execution_id = ctx.execution_id.clone();
    let entry_point = unit.entry_point.clone();
    let task = tokio::spawn(async move { sandbox.run(&unit, &input, &ctx).await });
    let abort = task.abort_handle();

    let res = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(res)) => res,
        Ok(Err(join_err)) => Err(SandboxFault::Runtime(format!("sandbox task failed: {}", join_err))),
        Err(_) => {
            abort.abort();
            Err(SandboxFault::Timeout(timeout))
        }
    };
    let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
    histogram!("sandbox_run_ms", took_ms);
    match &res {
        Ok(out) => debug!(execution_id = %execution_id, entry_point = %entry_point, took_ms, has_value = out.is_some(), "unit finished"),
        Err(fault) => {
            counter!("sandbox_faults", 1, "fault" => fault.label());
            warn!(execution_id = %execution_id, entry_point = %entry_point, fault = fault.label(), error = %fault, took_ms, "unit failed");
        }
    }
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn unit(entry: &str) -> WrappedUnit {
        WrappedUnit { entry_point: entry.to_string(), source: String::new() }
    }

    #[tokio::test]
    async fn returns_unit_value_before_deadline() {
        let sb = InProcessSandbox::new().register("main", |arg| async move { Ok(json!({"status": "ok", "payload": arg})) });
        let out = execute(Arc::new(sb), unit("main"), json!({"x": 1}), Duration::from_secs(5), ExecutionContext::new("e1"))
            .await
            .expect("value");
        assert_eq!(out, Some(json!({"status": "ok", "payload": {"x": 1}})));
    }

    #[tokio::test]
    async fn never_returning_unit_times_out_on_deadline() {
        let sb = InProcessSandbox::new().register("main", |_| std::future::pending::<Result<Value, String>>());
        let t0 = Instant::now();
        let res = execute(Arc::new(sb), unit("main"), json!(null), Duration::from_millis(50), ExecutionContext::new("e2")).await;
        let took = t0.elapsed();
        assert!(matches!(res, Err(SandboxFault::Timeout(d)) if d == Duration::from_millis(50)));
        assert!(took >= Duration::from_millis(50));
        assert!(took < Duration::from_millis(500), "call overran deadline: {:?}", took);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn call_returns_by_deadline_while_blocking_work_continues() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let sb = InProcessSandbox::new().register("main", move |_| {
            let flag = Arc::clone(&flag);
            async move {
                tokio::task::spawn_blocking(move || {
                    std::thread::sleep(Duration::from_millis(300));
                    flag.store(true, Ordering::SeqCst);
                })
                .await
                .map_err(|e| e.to_string())?;
                Ok(json!({"status": "ok"}))
            }
        });
        let t0 = Instant::now();
        let res = execute(Arc::new(sb), unit("main"), json!(null), Duration::from_millis(50), ExecutionContext::new("e3")).await;
        assert!(matches!(res, Err(SandboxFault::Timeout(_))));
        assert!(t0.elapsed() < Duration::from_millis(250));
        assert!(!finished.load(Ordering::SeqCst), "work should still be running when the call returns");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(finished.load(Ordering::SeqCst), "blocking work is not forcibly stopped");
    }

    #[tokio::test]
    async fn panicking_unit_is_a_runtime_fault() {
        let sb = InProcessSandbox::new().register("main", |_| async move {
            if true {
                panic!("harness exploded");
            }
            Ok(json!(null))
        });
        let res = execute(Arc::new(sb), unit("main"), json!(null), Duration::from_secs(1), ExecutionContext::new("e4")).await;
        match res {
            Err(SandboxFault::Runtime(msg)) => assert!(msg.contains("sandbox task failed")),
            other => panic!("unexpected: {:?}", other),
        }
    }
}

//! In-process sandbox: native handlers registered by entry-point name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;
use vigil_core::ExecutionContext;

use crate::{Sandbox, SandboxFault, UnitContext, WrappedUnit};

pub type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Runs native handlers with the same wrapper contract as the script units:
/// the handler's `Err` (or a missing entry point) becomes the fallback failure value.
#[derive(Clone, Default)]
pub struct InProcessSandbox {
    handlers: HashMap<String, Handler>,
}

impl InProcessSandbox {
    pub fn new() -> Self { Self::default() }

    pub fn register<F, Fut>(mut self, entry_point: &str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let h: Handler = Arc::new(move |arg| -> BoxFuture<'static, Result<Value, String>> { Box::pin(f(arg)) });
        self.handlers.insert(entry_point.to_string(), h);
        self
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> { self.handlers.keys().map(|s| s.as_str()) }
}

impl std::fmt::Debug for InProcessSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entry_points().collect();
        names.sort_unstable();
        f.debug_struct("InProcessSandbox").field("handlers", &names).finish()
    }
}

#[async_trait::async_trait]
impl Sandbox for InProcessSandbox {
    async fn run(&self, unit: &WrappedUnit, input: &Value, ctx: &ExecutionContext) -> Result<Option<Value>, SandboxFault> {
        let cx = UnitContext::extract(input);
        let outcome = match self.handlers.get(&unit.entry_point).cloned() {
            Some(handler) => {
                debug!(execution_id = %ctx.execution_id, entry_point = %unit.entry_point, "in-process handler start");
                handler(input.clone()).await
            }
            None => Err(format!("{} is not defined", unit.entry_point)),
        };
        Ok(Some(cx.settle(outcome)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unit(entry: &str) -> WrappedUnit {
        WrappedUnit { entry_point: entry.into(), source: String::new() }
    }

    #[tokio::test]
    async fn handler_error_keeps_captured_fields() {
        let sb = InProcessSandbox::new().register("create", |_| async { Err::<Value, _>("access denied".to_string()) });
        let input = json!([{"properties": {"si": {"resourceId": "i-7"}, "resource": {"payload": {"state": "running"}}}}]);
        let out = sb.run(&unit("create"), &input, &ExecutionContext::new("e")).await.unwrap();
        assert_eq!(
            out,
            Some(json!({"status": "error", "payload": {"state": "running"}, "resourceId": "i-7", "message": "access denied"}))
        );
    }

    #[tokio::test]
    async fn missing_entry_point_is_reported_as_value() {
        let sb = InProcessSandbox::new();
        let out = sb.run(&unit("refresh"), &json!(null), &ExecutionContext::new("e")).await.unwrap();
        assert_eq!(out, Some(json!({"status": "error", "payload": null, "message": "refresh is not defined"})));
    }

    #[tokio::test]
    async fn handler_receives_original_argument() {
        let sb = InProcessSandbox::new().register("echo", |arg| async move { Ok(arg) });
        let input = json!({"properties": {}});
        let out = sb.run(&unit("echo"), &input, &ExecutionContext::new("e")).await.unwrap();
        assert_eq!(out, Some(input));
    }
}

//! Vigil action runs: wrap the user code, execute it under a deadline, and encode the
//! raw return value into a validated success/failure document.
//!
//! [`encode`] is the single choke point between free-form user output and the protocol.
//! [`run_action`] never fails: every fault becomes a failure document.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{info, warn};
use vigil_core::{
    ActionHealth, ActionRunRequest, ActionRunResult, ActionRunSuccess, ErrorKind, ExecutionContext, ProtocolResult,
};
use vigil_sandbox::Sandbox;

const MSG_NULL_RETURN: &str = "Return type must not be null or undefined";
const MSG_STATUS: &str = r#"The status field type must be either "ok", "warning" or "error""#;
const MSG_OK_WITH_MESSAGE: &str = r#"The message field type must be undefined when status is "ok""#;
const MSG_MISSING_MESSAGE: &str = r#"The message field type must be string when status is either "warning" or "error""#;
// Worker typing rules, applied after the return-value checks above.
const MSG_RESOURCE_ID: &str = "Worker typing rule: the resourceId field must be a string or null to be carried in the result";
const MSG_ERROR_FIELD: &str = "Worker typing rule: the error field must be a string or null to be carried in the result";

/// Validate a unit's raw return value. `None` stands for "returned nothing".
/// Checks run in order and the first violation is reported.
pub fn encode(raw: Option<Value>) -> ActionRunResult {
    let raw = match raw {
        None | Some(Value::Null) => return ActionRunResult::failure(ErrorKind::InvalidReturnType, MSG_NULL_RETURN),
        Some(v) => v,
    };

    let health = match raw.get("status").and_then(Value::as_str).map(str::parse::<ActionHealth>) {
        Some(Ok(h)) => h,
        _ => return ActionRunResult::failure(ErrorKind::ActionFieldWrongType, MSG_STATUS),
    };

    let message = raw.get("message");
    match (health, message) {
        (ActionHealth::Ok, Some(_)) => {
            return ActionRunResult::failure(ErrorKind::ActionFieldWrongType, MSG_OK_WITH_MESSAGE);
        }
        (ActionHealth::Warning | ActionHealth::Error, m) if !m.is_some_and(Value::is_string) => {
            return ActionRunResult::failure(ErrorKind::ActionFieldWrongType, MSG_MISSING_MESSAGE);
        }
        _ => {}
    }

    let resource_id = match raw.get("resourceId") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return ActionRunResult::failure(ErrorKind::ActionFieldWrongType, MSG_RESOURCE_ID),
    };
    let error = match raw.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return ActionRunResult::failure(ErrorKind::ActionFieldWrongType, MSG_ERROR_FIELD),
    };

    ActionRunResult::Success(ActionRunSuccess {
        resource_id,
        payload: raw.get("payload").cloned().unwrap_or(Value::Null),
        health,
        message: message.and_then(Value::as_str).map(str::to_string),
        error,
    })
}

/// Wrap, execute and encode one action-run request.
pub async fn run_action(sandbox: Arc<dyn Sandbox>, req: &ActionRunRequest, default_timeout: Duration) -> ProtocolResult {
    let t0 = Instant::now();
    let timeout = req.timeout.unwrap_or(default_timeout);
    let ctx = ExecutionContext { execution_id: req.execution_id.clone() };
    info!(execution_id = %ctx.execution_id, handler = %req.handler, timeout_ms = timeout.as_millis() as u64, "action run start");

    let result = match vigil_sandbox::wrap(&req.code, &req.handler) {
        Err(e) => {
            warn!(execution_id = %ctx.execution_id, error = %e, "action run rejected before execution");
            ActionRunResult::failure(ErrorKind::ExecutionFailure, e.to_string())
        }
        Ok(unit) => match vigil_sandbox::execute(sandbox, unit, req.args.clone(), timeout, ctx.clone()).await {
            Ok(raw) => encode(raw),
            Err(fault) => ActionRunResult::failure(ErrorKind::ExecutionFailure, fault.to_string()),
        },
    };

    let status = if result.is_success() { "success" } else { "failure" };
    counter!("action_runs", 1, "status" => status);
    histogram!("action_run_ms", t0.elapsed().as_secs_f64() * 1000.0);
    match &result {
        ActionRunResult::Success(s) => {
            info!(execution_id = %ctx.execution_id, health = s.health.as_str(), took_ms = %t0.elapsed().as_millis(), "action run ok")
        }
        ActionRunResult::Failure(f) => {
            warn!(execution_id = %ctx.execution_id, kind = ?f.error.kind, message = %f.error.message, took_ms = %t0.elapsed().as_millis(), "action run failed")
        }
    }
    ProtocolResult::new(ctx.execution_id, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kind(r: &ActionRunResult) -> Option<ErrorKind> { r.error_kind() }

    #[test]
    fn null_and_absent_are_invalid_return_type() {
        assert_eq!(kind(&encode(None)), Some(ErrorKind::InvalidReturnType));
        assert_eq!(kind(&encode(Some(Value::Null))), Some(ErrorKind::InvalidReturnType));
    }

    #[test]
    fn status_must_be_a_known_string() {
        for raw in [json!({}), json!({"status": 1}), json!({"status": "fine"}), json!({"status": null}), json!(5), json!("ok")] {
            let r = encode(Some(raw.clone()));
            assert_eq!(kind(&r), Some(ErrorKind::ActionFieldWrongType), "raw {}", raw);
            match r {
                ActionRunResult::Failure(f) => assert_eq!(f.error.message, MSG_STATUS),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn ok_must_not_carry_a_message() {
        for msg in [json!("all good"), json!(null), json!(3)] {
            let r = encode(Some(json!({"status": "ok", "message": msg})));
            assert_eq!(kind(&r), Some(ErrorKind::ActionFieldWrongType));
        }
    }

    #[test]
    fn warning_and_error_require_string_message() {
        for status in ["warning", "error"] {
            for raw in [json!({"status": status}), json!({"status": status, "message": null}), json!({"status": status, "message": 1})] {
                let r = encode(Some(raw));
                assert_eq!(kind(&r), Some(ErrorKind::ActionFieldWrongType));
            }
            let r = encode(Some(json!({"status": status, "message": "degraded"})));
            match r {
                ActionRunResult::Success(s) => assert_eq!(s.message.as_deref(), Some("degraded")),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn success_preserves_resource_id_and_payload() {
        let r = encode(Some(json!({"status": "ok", "resourceId": "i-1", "payload": {"a": 1}})));
        match r {
            ActionRunResult::Success(s) => {
                assert_eq!(s.resource_id.as_deref(), Some("i-1"));
                assert_eq!(serde_json::to_string(&s.payload).unwrap(), r#"{"a":1}"#);
                assert_eq!(s.health, ActionHealth::Ok);
                assert!(s.message.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn error_status_copies_error_field() {
        let r = encode(Some(json!({"status": "error", "message": "create failed", "error": "AccessDenied", "resourceId": null})));
        match r {
            ActionRunResult::Success(s) => {
                assert_eq!(s.health, ActionHealth::Error);
                assert_eq!(s.error.as_deref(), Some("AccessDenied"));
                assert!(s.resource_id.is_none());
                assert_eq!(s.payload, Value::Null);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_string_resource_id_or_error_is_rejected() {
        let r = encode(Some(json!({"status": "ok", "resourceId": 17})));
        assert_eq!(kind(&r), Some(ErrorKind::ActionFieldWrongType));
        let r = encode(Some(json!({"status": "ok", "error": {"code": 1}})));
        assert_eq!(kind(&r), Some(ErrorKind::ActionFieldWrongType));
    }

    #[test]
    fn typing_rule_messages_are_distinct_from_return_value_checks() {
        for (raw, expected) in [
            (json!({"status": "ok", "resourceId": 17}), MSG_RESOURCE_ID),
            (json!({"status": "warning", "message": "slow", "error": false}), MSG_ERROR_FIELD),
        ] {
            match encode(Some(raw)) {
                ActionRunResult::Failure(f) => {
                    assert_eq!(f.error.message, expected);
                    assert!(f.error.message.starts_with("Worker typing rule:"));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        for msg in [MSG_NULL_RETURN, MSG_STATUS, MSG_OK_WITH_MESSAGE, MSG_MISSING_MESSAGE] {
            assert!(!msg.starts_with("Worker typing rule:"));
        }
    }
}

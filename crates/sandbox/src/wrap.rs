//! Code wrapper: turns a user handler body plus an entry-point name into a unit that
//! always returns a value and never raises.
//!
//! Two renditions share one contract. [`wrap`] emits a Node.js unit with a stdin/stdout
//! harness for [`crate::ProcessSandbox`]; [`UnitContext`] is the native rendition used by
//! [`crate::InProcessSandbox`], where a handler returns `Result<Value, String>` and the
//! `Err` side is settled into the fallback failure value.

use serde_json::{json, Map, Value};

/// An executable unit ready to hand to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedUnit {
    pub entry_point: String,
    pub source: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WrapError {
    #[error("invalid entry point {0:?}: expected a JavaScript identifier")]
    InvalidEntryPoint(String),
    #[error("invalid entry point {0:?}: names starting with __VIGIL_ are reserved")]
    ReservedEntryPoint(String),
}

/// Harness placeholders start with this; entry points may not.
const RESERVED_PREFIX: &str = "__VIGIL_";

const UNIT_TEMPLATE: &str = r#"console.log = (...args) => console.error(...args);

async function __vigilRun(__vigilArg) {
  const __vigilOriginal = __vigilArg;
  const __vigilArgs = Array.isArray(__vigilArg) ? __vigilArg : [__vigilArg];
  const __vigilResourceId = __vigilArgs[0]?.properties?.si?.resourceId;
  const __vigilPayload = __vigilArgs[0]?.properties?.resource?.payload ?? null;
  try {
    __VIGIL_CODE__
    const __vigilReturn = await __VIGIL_ENTRY__(__vigilOriginal);
    return __vigilReturn;
  } catch (err) {
    return {
      status: "error",
      payload: __vigilPayload,
      resourceId: __vigilResourceId,
      message: err?.message ?? String(err),
    };
  }
}

const __vigilChunks = [];
process.stdin.on("data", (chunk) => __vigilChunks.push(chunk));
process.stdin.on("end", () => {
  const text = Buffer.concat(__vigilChunks).toString("utf8");
  const input = text.trim() === "" ? null : JSON.parse(text);
  __vigilRun(input).then(
    (out) => {
      if (out !== undefined) process.stdout.write(JSON.stringify(out));
    },
    (err) => {
      console.error(err);
      process.exit(70);
    },
  );
});
"#;

/// Wrap `code` so that invoking the unit calls `entry_point` with the unit's input.
pub fn wrap(code: &str, entry_point: &str) -> Result<WrappedUnit, WrapError> {
    if !is_identifier(entry_point) {
        return Err(WrapError::InvalidEntryPoint(entry_point.to_string()));
    }
    if entry_point.starts_with(RESERVED_PREFIX) {
        return Err(WrapError::ReservedEntryPoint(entry_point.to_string()));
    }
    // entry point first: user code may legitimately contain either placeholder text
    let source = UNIT_TEMPLATE
        .replace("__VIGIL_ENTRY__", entry_point)
        .replace("__VIGIL_CODE__", code);
    Ok(WrappedUnit { entry_point: entry_point.to_string(), source })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Fields captured from the unit input before the handler runs, so they remain
/// available for failure reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitContext {
    pub resource_id: Option<Value>,
    pub payload: Value,
}

impl UnitContext {
    /// Extract from `arg[0]` (a bare value counts as a one-element sequence).
    /// Missing or malformed input yields no resource id and a null payload.
    pub fn extract(arg: &Value) -> Self {
        let first = match arg {
            Value::Array(items) => items.first(),
            other => Some(other),
        };
        let resource_id = first.and_then(|v| v.pointer("/properties/si/resourceId")).cloned();
        let payload = first
            .and_then(|v| v.pointer("/properties/resource/payload"))
            .cloned()
            .unwrap_or(Value::Null);
        Self { resource_id, payload }
    }

    /// The fallback value returned in place of a raised error.
    pub fn failure(&self, message: &str) -> Value {
        let mut out = Map::new();
        out.insert("status".into(), json!("error"));
        out.insert("payload".into(), self.payload.clone());
        if let Some(id) = &self.resource_id {
            out.insert("resourceId".into(), id.clone());
        }
        out.insert("message".into(), json!(message));
        Value::Object(out)
    }

    pub fn settle(&self, outcome: Result<Value, String>) -> Value {
        match outcome {
            Ok(v) => v,
            Err(message) => self.failure(&message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_embeds_code_and_entry_point() {
        let unit = wrap("async function create(input) { return { status: 'ok' }; }", "create").unwrap();
        assert_eq!(unit.entry_point, "create");
        assert!(unit.source.contains("async function create(input)"));
        assert!(unit.source.contains("await create(__vigilOriginal)"));
        assert!(!unit.source.contains("__VIGIL_"));
    }

    #[test]
    fn wrap_rejects_non_identifier_entry_points() {
        assert!(wrap("", "main(); process.exit(0); //").is_err());
        assert!(wrap("", "1abc").is_err());
        assert!(wrap("", "").is_err());
        assert!(wrap("", "$main_2").is_ok());
    }

    #[test]
    fn wrap_rejects_placeholder_names_as_entry_points() {
        for name in ["__VIGIL_CODE__", "__VIGIL_ENTRY__"] {
            assert!(matches!(wrap("async function main() {}", name), Err(WrapError::ReservedEntryPoint(n)) if n == name));
        }
        assert!(wrap("", "__vigil_like").is_ok());
    }

    #[test]
    fn harness_names_do_not_collide_with_common_user_names() {
        let unit = wrap("var resourceId; var args; var payload; let returnValue;", "main").unwrap();
        for name in ["const resourceId", "const args", "const payload", "const original", "const returnValue"] {
            assert!(!unit.source.contains(name), "{}", name);
        }
    }

    #[test]
    fn extract_reads_first_element_of_sequence() {
        let arg = json!([{"properties": {"si": {"resourceId": "i-1"}, "resource": {"payload": {"a": 1}}}}, {"ignored": true}]);
        let cx = UnitContext::extract(&arg);
        assert_eq!(cx.resource_id, Some(json!("i-1")));
        assert_eq!(cx.payload, json!({"a": 1}));
    }

    #[test]
    fn extract_treats_bare_value_as_single_element() {
        let arg = json!({"properties": {"si": {"resourceId": "i-2"}}});
        let cx = UnitContext::extract(&arg);
        assert_eq!(cx.resource_id, Some(json!("i-2")));
        assert_eq!(cx.payload, Value::Null);
    }

    #[test]
    fn extract_tolerates_missing_or_malformed_input() {
        for arg in [json!([]), json!(null), json!("text"), json!([42]), json!([{"properties": 7}])] {
            let cx = UnitContext::extract(&arg);
            assert_eq!(cx.resource_id, None, "arg {}", arg);
            assert_eq!(cx.payload, Value::Null, "arg {}", arg);
        }
    }

    #[test]
    fn settle_converts_error_into_failure_value() {
        let cx = UnitContext { resource_id: Some(json!("i-9")), payload: json!({"p": true}) };
        assert_eq!(cx.settle(Ok(json!({"status": "ok"}))), json!({"status": "ok"}));
        assert_eq!(
            cx.settle(Err("boom".into())),
            json!({"status": "error", "payload": {"p": true}, "resourceId": "i-9", "message": "boom"})
        );
        let bare = UnitContext::extract(&json!(null));
        assert_eq!(bare.failure("x"), json!({"status": "error", "payload": null, "message": "x"}));
    }
}

//! Action-run request and result documents.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ExecutionId;

/// Health reported by an action function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ActionHealth {
    Ok,
    Warning,
    Error,
}

impl ActionHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionHealth::Ok => "ok",
            ActionHealth::Warning => "warning",
            ActionHealth::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown health: {0}")]
pub struct UnknownHealth(pub String);

impl FromStr for ActionHealth {
    type Err = UnknownHealth;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(ActionHealth::Ok),
            "warning" => Ok(ActionHealth::Warning),
            "error" => Ok(ActionHealth::Error),
            other => Err(UnknownHealth(other.to_string())),
        }
    }
}

/// Kinds of reported failures. Each kind documents one validation or execution failure mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorKind {
    /// The function returned null or nothing at all.
    InvalidReturnType,
    /// A field of the returned value has the wrong type or violates the health/message rule.
    ActionFieldWrongType,
    /// The function could not be run to completion (timeout, crash, harness fault).
    ExecutionFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunSuccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub health: ActionHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRunFailure {
    pub error: FunctionError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ActionRunResult {
    Success(ActionRunSuccess),
    Failure(ActionRunFailure),
}

impl ActionRunResult {
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        ActionRunResult::Failure(ActionRunFailure { error: FunctionError { kind, message: message.into() } })
    }

    pub fn is_success(&self) -> bool { matches!(self, ActionRunResult::Success(_)) }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ActionRunResult::Failure(f) => Some(f.error.kind),
            ActionRunResult::Success(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Result,
}

/// Wire envelope: `{ protocol: "result", status, executionId, ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolResult {
    pub protocol: Protocol,
    pub execution_id: ExecutionId,
    #[serde(flatten)]
    pub result: ActionRunResult,
}

impl ProtocolResult {
    pub fn new(execution_id: ExecutionId, result: ActionRunResult) -> Self {
        Self { protocol: Protocol::Result, execution_id, result }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRunRequest {
    pub execution_id: ExecutionId,
    #[serde(default)]
    pub args: Value,
    pub code: String,
    /// Name of the entry point defined by `code`.
    #[serde(alias = "entryPoint")]
    pub handler: String,
    /// Absent means the worker default applies.
    #[serde(default, rename = "timeoutMs", with = "duration_ms", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(d) => s.serialize_u64(d.as_millis() as u64),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

//! Vigil core types: execution context, resource state, discovery tree.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod entity;
pub mod protocol;

pub use entity::{EntityRef, Op, OpKind, OpSource, BASELINE_SYSTEM};
pub use protocol::{
    ActionHealth, ActionRunFailure, ActionRunRequest, ActionRunResult, ActionRunSuccess, ErrorKind,
    FunctionError, Protocol, ProtocolResult,
};

/// Caller-generated identifier correlating one request with its response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ExecutionId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub execution_id: ExecutionId,
}

impl ExecutionContext {
    pub fn new(execution_id: impl Into<ExecutionId>) -> Self {
        Self { execution_id: execution_id.into() }
    }
}

impl From<String> for ExecutionId {
    fn from(s: String) -> Self { Self(s) }
}

/// Externally observable health of a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceHealth {
    Ok,
    Warning,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResourceInternalHealth {
    Ok,
    Warning,
    Error,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ResourceInternalStatus {
    #[default]
    Pending,
    InProgress,
    Created,
    Failed,
    Deleted,
}

/// Last computed state of one monitored resource. Replaced wholesale on every sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: String,
    pub health: ResourceHealth,
    pub internal_health: ResourceInternalHealth,
    pub internal_status: ResourceInternalStatus,
    #[serde(default = "empty_object")]
    pub sub_resources: Value,
}

impl Default for ResourceState {
    fn default() -> Self {
        Self {
            data: empty_object(),
            error: None,
            state: "unknown".to_string(),
            health: ResourceHealth::Unknown,
            internal_health: ResourceInternalHealth::Unknown,
            internal_status: ResourceInternalStatus::Pending,
            sub_resources: empty_object(),
        }
    }
}

fn empty_object() -> Value { Value::Object(serde_json::Map::new()) }

/// A resource state as last observed for a given entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    pub entity_id: String,
    #[serde(flatten)]
    pub state: ResourceState,
}

/// One node of a discovery tree; `configures` holds what this entity provisions or contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub entity: EntityRef,
    #[serde(default)]
    pub configures: Vec<DiscoveryNode>,
}

impl DiscoveryNode {
    pub fn leaf(entity: EntityRef) -> Self { Self { entity, configures: Vec::new() } }

    pub fn with_child(mut self, child: DiscoveryNode) -> Self {
        self.configures.push(child);
        self
    }

    /// Depth-first, parent before children.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a DiscoveryNode)) {
        f(self);
        for child in &self.configures {
            child.visit(f);
        }
    }

    pub fn len(&self) -> usize {
        let mut n = 0;
        self.visit(&mut |_| n += 1);
        n
    }
}

pub mod prelude {
    pub use super::{
        DiscoveryNode, EntityRef, ExecutionContext, ExecutionId, Op, OpSource, ResourceHealth,
        ResourceInternalHealth, ResourceInternalStatus, ResourceSnapshot, ResourceState,
    };
}

//! Vigil intel: per-entity-type discovery and sync.
//!
//! Discovery enumerates live provider resources into a fresh tree of entities whose ops
//! are `Inferred` on the baseline system. Sync recomputes one resource's state from the
//! last-known snapshot of the entity it depends on.

#![forbid(unsafe_code)]

use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use vigil_core::{
    DiscoveryNode, EntityRef, ExecutionId, ResourceHealth, ResourceInternalHealth, ResourceSnapshot, ResourceState,
};
use vigil_provider::{ProviderCall, ProviderClient, ProviderContext, ProviderError};

pub mod aws_eks;
pub mod registry;

pub use aws_eks::AwsEks;
pub use registry::{IntelRegistry, RegistryError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRequest {
    pub execution_id: ExecutionId,
    pub entity_type: String,
    #[serde(default)]
    pub provider: ProviderContext,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    pub discovered: Vec<DiscoveryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResourceRequest {
    pub execution_id: ExecutionId,
    /// The entity whose resource is being synced.
    pub entity: EntityRef,
    /// Its current resource state.
    #[serde(default)]
    pub resource: ResourceState,
    /// Entities this one is connected to upstream.
    #[serde(default)]
    pub predecessors: Vec<EntityRef>,
    /// Last-known snapshots of related resources. Read-only for the duration of a sync.
    #[serde(default)]
    pub resource_context: Vec<ResourceSnapshot>,
}

impl SyncResourceRequest {
    pub fn find_entity_by_type(&self, entity_type: &str) -> Option<&EntityRef> {
        self.predecessors.iter().find(|e| e.entity_type == entity_type)
    }

    /// First snapshot for `entity_id` in context order.
    pub fn snapshot_for(&self, entity_id: &str) -> Option<&ResourceSnapshot> {
        let mut matches = self.resource_context.iter().filter(|r| r.entity_id == entity_id);
        let first = matches.next();
        let extra = matches.count();
        if extra > 0 {
            warn!(execution_id = %self.execution_id, entity_id, duplicates = extra + 1, "multiple snapshots for one entity; using the first");
        }
        first
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("provider call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("unparseable output from `{call}`: {source}")]
    Parse {
        call: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Discovery and sync for one entity type.
#[async_trait::async_trait]
pub trait Intel: Send + Sync {
    /// Stable registry key.
    fn entity_type(&self) -> &'static str;

    /// All-or-nothing: any provider fault aborts the whole pass.
    async fn discover(&self, provider: &dyn ProviderClient, req: &DiscoveryRequest) -> Result<DiscoveryResult, DiscoveryError>;

    fn sync(&self, req: &SyncResourceRequest) -> ResourceState;
}

/// Parse a provider response. Unparseable output is logged verbatim and returned as an error.
pub fn parse_output(call: &ProviderCall, raw: &str) -> Result<Value, DiscoveryError> {
    serde_json::from_str(raw).map_err(|source| {
        counter!("discovery_parse_errors", 1, "call" => call.key());
        warn!(call = %call, error = %source, output = %raw, "unparseable provider output");
        DiscoveryError::Parse { call: call.to_string(), source }
    })
}

/// Outcome of propagating state from an upstream dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    NoDependency,
    SnapshotFound,
    SnapshotMissing,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::NoDependency => "no_dependency",
            SyncOutcome::SnapshotFound => "snapshot_found",
            SyncOutcome::SnapshotMissing => "snapshot_missing",
        }
    }
}

/// Recompute `req`'s resource state from the first predecessor of `upstream_type`.
///
/// The result starts from the request's current resource with `data` reset. Snapshots in
/// the request are only read, never modified.
pub fn propagate_from(req: &SyncResourceRequest, upstream_type: &str, missing_message: &str) -> (SyncOutcome, ResourceState) {
    let mut out = ResourceState {
        data: Value::Object(serde_json::Map::new()),
        error: None,
        ..req.resource.clone()
    };
    let outcome = match req.find_entity_by_type(upstream_type) {
        None => {
            out.error = Some(missing_message.to_string());
            out.state = "error".to_string();
            out.health = ResourceHealth::Error;
            out.internal_health = ResourceInternalHealth::Error;
            SyncOutcome::NoDependency
        }
        Some(upstream) => match req.snapshot_for(&upstream.id) {
            Some(snapshot) => {
                out = snapshot.state.clone();
                SyncOutcome::SnapshotFound
            }
            None => {
                out.state = "unknown".to_string();
                out.health = ResourceHealth::Unknown;
                out.internal_health = ResourceInternalHealth::Unknown;
                SyncOutcome::SnapshotMissing
            }
        },
    };
    counter!("sync_outcomes", 1, "outcome" => outcome.as_str());
    info!(execution_id = %req.execution_id, entity = %req.entity.id, upstream = upstream_type, outcome = outcome.as_str(), "sync computed");
    (outcome, out)
}

//! Vigil worker: typed request/response envelopes, a dispatcher over the sandbox, the
//! provider client and the intel registry, and a bounded serve loop.
//!
//! Every request yields exactly one response carrying the request's `executionId`.
//! Responses are not ordered relative to each other.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, info, warn};
use vigil_core::{ActionRunRequest, DiscoveryNode, ExecutionId, ProtocolResult, ResourceState};
use vigil_intel::{DiscoveryError, DiscoveryRequest, IntelRegistry, RegistryError, SyncResourceRequest};
use vigil_provider::{CliProvider, ProviderClient};
use vigil_sandbox::{ProcessSandbox, Sandbox};

pub mod config;

pub use config::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Request {
    ActionRun(ActionRunRequest),
    Discover(DiscoveryRequest),
    Sync(SyncResourceRequest),
}

impl Request {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Request::ActionRun(r) => &r.execution_id,
            Request::Discover(r) => &r.execution_id,
            Request::Sync(r) => &r.execution_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::ActionRun(_) => "actionRun",
            Request::Discover(_) => "discover",
            Request::Sync(_) => "sync",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResponse {
    pub execution_id: ExecutionId,
    pub discovered: Vec<DiscoveryNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub execution_id: ExecutionId,
    #[serde(flatten)]
    pub state: ResourceState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FaultResponse {
    pub execution_id: ExecutionId,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Response {
    ActionRun(ProtocolResult),
    Discover(DiscoveryResponse),
    Sync(SyncResponse),
    Fault(FaultResponse),
}

impl Response {
    pub fn execution_id(&self) -> &ExecutionId {
        match self {
            Response::ActionRun(r) => &r.execution_id,
            Response::Discover(r) => &r.execution_id,
            Response::Sync(r) => &r.execution_id,
            Response::Fault(r) => &r.execution_id,
        }
    }

    pub fn fault(execution_id: ExecutionId, message: impl Into<String>) -> Self {
        Response::Fault(FaultResponse { execution_id, message: message.into() })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("discovery timed out after {}ms", .0.as_millis())]
    DiscoveryTimeout(Duration),
}

pub type WorkerResult<T> = Result<T, WorkerError>;

pub struct Worker {
    sandbox: Arc<dyn Sandbox>,
    provider: Arc<dyn ProviderClient>,
    intel: IntelRegistry,
    config: WorkerConfig,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker").field("intel", &self.intel).field("config", &self.config).finish_non_exhaustive()
    }
}

impl Worker {
    pub fn new(sandbox: Arc<dyn Sandbox>, provider: Arc<dyn ProviderClient>, intel: IntelRegistry, config: WorkerConfig) -> Self {
        Self { sandbox, provider, intel, config }
    }

    /// Subprocess sandbox, CLI provider and the builtin intels, all from `config`.
    pub fn from_config(config: WorkerConfig) -> WorkerResult<Self> {
        let sandbox = Arc::new(ProcessSandbox::new(config.sandbox_program.clone(), config.sandbox_args.clone()));
        let provider = Arc::new(CliProvider::new(config.provider_bin.clone()));
        Ok(Self::new(sandbox, provider, IntelRegistry::builtin()?, config))
    }

    pub fn config(&self) -> &WorkerConfig { &self.config }

    pub async fn action_run(&self, req: &ActionRunRequest) -> ProtocolResult {
        vigil_action::run_action(Arc::clone(&self.sandbox), req, self.config.default_timeout).await
    }

    pub async fn discover(&self, req: &DiscoveryRequest) -> WorkerResult<DiscoveryResponse> {
        let intel = self.intel.get(&req.entity_type)?;
        let limit = self.config.discovery_timeout;
        // dropping the pass kills any in-flight provider process
        let result = tokio::time::timeout(limit, intel.discover(self.provider.as_ref(), req))
            .await
            .map_err(|_| WorkerError::DiscoveryTimeout(limit))??;
        Ok(DiscoveryResponse { execution_id: req.execution_id.clone(), discovered: result.discovered })
    }

    pub fn sync(&self, req: &SyncResourceRequest) -> WorkerResult<SyncResponse> {
        let intel = self.intel.get(&req.entity.entity_type)?;
        Ok(SyncResponse { execution_id: req.execution_id.clone(), state: intel.sync(req) })
    }

    /// Dispatch one request. Never fails: worker-level errors become [`Response::Fault`].
    pub async fn handle(&self, req: Request) -> Response {
        let t0 = Instant::now();
        let kind = req.kind();
        let execution_id = req.execution_id().clone();
        debug!(execution_id = %execution_id, kind, "request start");
        let res = match &req {
            Request::ActionRun(r) => Ok(Response::ActionRun(self.action_run(r).await)),
            Request::Discover(r) => self.discover(r).await.map(Response::Discover),
            Request::Sync(r) => self.sync(r).map(Response::Sync),
        };
        histogram!("worker_request_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
        match res {
            Ok(resp) => {
                counter!("worker_requests", 1, "kind" => kind, "outcome" => "ok");
                info!(execution_id = %execution_id, kind, took_ms = %t0.elapsed().as_millis(), "request done");
                resp
            }
            Err(e) => {
                counter!("worker_requests", 1, "kind" => kind, "outcome" => "fault");
                warn!(execution_id = %execution_id, kind, error = %e, took_ms = %t0.elapsed().as_millis(), "request fault");
                Response::fault(execution_id, e.to_string())
            }
        }
    }

    /// Consume requests until `rx` closes, one task per request with at most
    /// `max_concurrency` in flight. Returns after every accepted request was answered.
    pub async fn serve(self: Arc<Self>, mut rx: mpsc::Receiver<Request>, tx: mpsc::Sender<Response>) {
        let max = self.config.max_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(max));
        let mut accepted = 0u64;
        info!(max_concurrency = max, "serve loop start");
        while let Some(req) = rx.recv().await {
            let permit = match Arc::clone(&permits).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            accepted += 1;
            let worker = Arc::clone(&self);
            let tx = tx.clone();
            tokio::spawn(async move {
                let execution_id = req.execution_id().clone();
                let resp = worker.handle(req).await;
                drop(permit);
                if tx.send(resp).await.is_err() {
                    debug!(execution_id = %execution_id, "response channel closed; dropping response");
                }
            });
        }
        // every in-flight task holds one permit
        if permits.acquire_many(max as u32).await.is_err() {
            warn!("serve loop semaphore closed while draining");
        }
        info!(accepted, "serve loop stopped");
    }
}

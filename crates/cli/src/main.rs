#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use vigil_core::{ActionRunRequest, ActionRunResult, DiscoveryNode, ExecutionId, BASELINE_SYSTEM};
use vigil_intel::{DiscoveryRequest, SyncResourceRequest};
use vigil_provider::ProviderContext;
use vigil_worker::{Request, Response, Worker, WorkerConfig};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Vigil worker CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one provider function and print its result document
    ActionRun {
        /// File with the function source
        #[arg(long = "code")]
        code: PathBuf,
        /// Entry point defined by the source, e.g. "create"
        #[arg(long = "handler")]
        handler: String,
        /// JSON argument list passed to the entry point
        #[arg(long = "args", default_value = "[]")]
        args: String,
        /// Wall-clock limit (default: VIGIL_DEFAULT_TIMEOUT_MS)
        #[arg(long = "timeout-ms")]
        timeout_ms: Option<u64>,
        #[arg(long = "execution-id")]
        execution_id: Option<String>,
    },
    /// Discover live resources for an entity type
    Discover {
        /// Entity type, e.g. "awsEks"
        entity_type: String,
        #[arg(long = "region", env = "AWS_DEFAULT_REGION", default_value = "")]
        region: String,
        #[arg(long = "access-key-id", env = "AWS_ACCESS_KEY_ID", hide_env_values = true)]
        access_key_id: Option<String>,
        #[arg(long = "secret-access-key", env = "AWS_SECRET_ACCESS_KEY", hide_env_values = true)]
        secret_access_key: Option<String>,
        #[arg(long = "execution-id")]
        execution_id: Option<String>,
    },
    /// Compute a resource's state from a JSON sync request ("-" reads stdin)
    Sync {
        request: PathBuf,
    },
    /// Answer newline-delimited JSON requests from stdin on stdout
    Serve,
    /// Print the runnable unit generated for a function source
    Wrap {
        #[arg(long = "code")]
        code: PathBuf,
        #[arg(long = "handler")]
        handler: String,
    },
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries protocol output
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

fn execution_id(given: Option<String>) -> ExecutionId {
    ExecutionId::new(given.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
}

fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        return std::io::read_to_string(std::io::stdin()).context("reading stdin");
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_tree(node: &DiscoveryNode, depth: usize) {
    let name = node.entity.value(&["name"], BASELINE_SYSTEM);
    let name = name.as_ref().and_then(|v| v.as_str()).unwrap_or(&node.entity.name);
    println!("{}{} {} ({})", "  ".repeat(depth), node.entity.entity_type, name, node.entity.id);
    for child in &node.configures {
        print_tree(child, depth + 1);
    }
}

/// Faults for lines that never became a request; the id is recovered when the line is JSON.
fn unparsed_fault(line: &str, err: &serde_json::Error) -> Response {
    let id = serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("executionId").and_then(|id| id.as_str()).map(str::to_string))
        .unwrap_or_default();
    Response::fault(ExecutionId::new(id), format!("invalid request: {}", err))
}

async fn serve(worker: Arc<Worker>) -> Result<()> {
    let cap = worker.config().queue_cap;
    let (req_tx, req_rx) = mpsc::channel::<Request>(cap);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Response>(cap);

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(resp) = resp_rx.recv().await {
            let mut line = serde_json::to_vec(&resp)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });
    let serve_loop = tokio::spawn(Arc::clone(&worker).serve(req_rx, resp_tx.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt; draining in-flight requests");
                break;
            }
            next = lines.next_line() => {
                let Some(line) = next.context("reading stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Request>(&line) {
                    Ok(req) => {
                        if req_tx.send(req).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "unparseable request line");
                        if resp_tx.send(unparsed_fault(&line, &e)).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    drop(req_tx);
    drop(resp_tx);
    serve_loop.await.context("serve loop panicked")?;
    writer.await.context("stdout writer panicked")??;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = WorkerConfig::from_env();
    info!(?config, "worker config");
    let worker = Arc::new(Worker::from_config(config)?);

    match cli.command {
        Commands::ActionRun { code, handler, args, timeout_ms, execution_id: id } => {
            let req = ActionRunRequest {
                execution_id: execution_id(id),
                args: serde_json::from_str(&args).context("--args must be JSON")?,
                code: read_input(&code)?,
                handler,
                timeout: timeout_ms.map(Duration::from_millis),
            };
            let res = worker.action_run(&req).await;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
                Output::Human => match &res.result {
                    ActionRunResult::Success(s) => {
                        println!("{} • {}", res.execution_id, s.health.as_str());
                        if let Some(id) = &s.resource_id {
                            println!("resourceId: {}", id);
                        }
                        if let Some(m) = &s.message {
                            println!("message: {}", m);
                        }
                        println!("payload: {}", s.payload);
                    }
                    ActionRunResult::Failure(f) => {
                        println!("{} • failure • {:?}: {}", res.execution_id, f.error.kind, f.error.message);
                    }
                },
            }
        }
        Commands::Discover { entity_type, region, access_key_id, secret_access_key, execution_id: id } => {
            let provider = match (access_key_id, secret_access_key) {
                (Some(key), Some(secret)) => ProviderContext::aws(&key, &secret, &region),
                _ => ProviderContext { region, ..Default::default() },
            };
            let req = DiscoveryRequest { execution_id: execution_id(id), entity_type, provider };
            let res = worker.discover(&req).await?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
                Output::Human => {
                    for root in &res.discovered {
                        print_tree(root, 0);
                    }
                    let total: usize = res.discovered.iter().map(DiscoveryNode::len).sum();
                    println!("{} entities in {} trees", total, res.discovered.len());
                }
            }
        }
        Commands::Sync { request } => {
            let req: SyncResourceRequest =
                serde_json::from_str(&read_input(&request)?).context("parsing sync request")?;
            let res = worker.sync(&req)?;
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&res)?),
                Output::Human => {
                    let st = &res.state;
                    println!("{} • {} • {:?}", res.execution_id, st.state, st.health);
                    if let Some(e) = &st.error {
                        println!("error: {}", e);
                    }
                    println!("data: {}", st.data);
                }
            }
        }
        Commands::Serve => serve(worker).await?,
        Commands::Wrap { code, handler } => {
            let unit = vigil_sandbox::wrap(&read_input(&code)?, &handler)?;
            println!("{}", unit.source);
        }
    }
    Ok(())
}

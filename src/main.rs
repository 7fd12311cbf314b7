use std::env;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use route_enrich::errors::display_causes;
use route_enrich::providers::shared_http_client;
use route_enrich::request::SolveRequest;
use route_enrich::semantic::default_worker_pool;
use route_enrich::server::{run_server, run_solve, AppState};
use route_enrich::Result;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info_span};
use tracing_subscriber::{
    fmt::{format::FmtSpan, Subscriber},
    prelude::*,
    EnvFilter,
};

/// Our command-line arguments.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "solve VRP requests and enrich the routes with weather, traffic and administrative context"
)]
struct Opt {
    /// Whole-request deadline for enrichment, in seconds.
    #[arg(long = "deadline-sec", default_value = "60")]
    deadline_sec: u64,

    /// Bounded worker pool for per-segment fan-out. Defaults to
    /// min(8, 2 x CPU).
    #[arg(long = "worker-pool")]
    worker_pool: Option<usize>,

    /// Reverse-geocoding endpoint(s), tried in order. Repeatable.
    #[arg(long = "reverse-endpoint", value_name = "URL")]
    reverse_endpoints: Vec<String>,

    /// Area-query (Overpass) endpoint.
    #[arg(long = "area-endpoint", value_name = "URL")]
    area_endpoint: Option<String>,

    /// Command to run.
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start in server mode.
    Server {
        /// Address that the server should listen on.
        #[arg(long = "listen-address", default_value = "127.0.0.1:8787")]
        listen_address: String,
    },
}

// We rely on the fact that `anyhow::Error` has a `Debug` implementation that
// will print a nice friendly error if we return from `main` with an error.
#[tokio::main]
async fn main() -> Result<()> {
    // Configure tracing.
    let filter = EnvFilter::from_default_env();
    Subscriber::builder()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_env_filter(filter)
        .finish()
        .init();
    let _span = info_span!("route-enrich").entered();
    debug!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let opt = Opt::parse();

    let worker_pool = opt.worker_pool.unwrap_or_else(default_worker_pool);
    let here_api_key = env::var("HERE_API_KEY").ok().filter(|k| !k.trim().is_empty());
    let mut state = AppState::new(shared_http_client(worker_pool), here_api_key);
    state.deadline_secs = opt.deadline_sec;
    state.worker_pool = worker_pool;
    state.reverse_endpoints = opt.reverse_endpoints;
    state.area_endpoint = opt.area_endpoint;
    let state = Arc::new(state);

    match opt.cmd {
        Some(Command::Server { listen_address }) => run_server(&listen_address, state).await,
        None => solve_stdio(state).await,
    }
}

/// Read one request JSON from standard input, write the response JSON to
/// standard output.
async fn solve_stdio(state: Arc<AppState>) -> Result<()> {
    let mut raw = String::new();
    tokio::io::stdin().read_to_string(&mut raw).await?;
    let request: SolveRequest = serde_json::from_str(&raw)
        .map_err(|err| anyhow::format_err!("could not parse request JSON: {}", err))?;

    match run_solve(request, &state).await {
        Ok(response) => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(serde_json::to_string_pretty(&response)?.as_bytes())
                .await?;
            stdout.write_all(b"\n").await?;
            Ok(())
        }
        Err(api_err) => {
            let err = anyhow::format_err!("{} ({})", api_err.message, api_err.status);
            display_causes(&err);
            Err(err)
        }
    }
}

//! promptgated: Promptgate daemon.
//!
//! Serves a [`Gateway`](promptgate::Gateway) over gRPC so several
//! application processes share one cache, one budget ledger and one job
//! queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

use promptgate::PromptgateError;
use promptgate::server::PromptgateService;
use promptgate::server::config::{Config, Secrets};
use promptgate::server::proto::promptgate_server::PromptgateServer;

/// Promptgate daemon: LLM request orchestration gateway.
#[derive(Parser)]
#[command(name = "promptgated")]
#[command(version = promptgate::version::PKG_VERSION)]
#[command(about = "Promptgate LLM gateway daemon")]
struct Args {
    /// Path to configuration file.
    #[arg(short, long, env = "PROMPTGATE_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Override the bind address from the config file.
    #[arg(short, long)]
    address: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let secrets = Secrets::load()?;

    let gateway = Arc::new(config.gateway_builder(&secrets).build()?);

    let address = args.address.unwrap_or_else(|| config.server.address.clone());
    let addr: SocketAddr = address
        .parse()
        .map_err(|e| PromptgateError::Configuration(format!("Invalid address: {e}")))?;

    info!(version = promptgate::version::version_string(), %addr, "promptgated starting");

    let service = PromptgateService::new(Arc::clone(&gateway));
    Server::builder()
        .timeout(Duration::from_secs(config.server.request_timeout_secs))
        .concurrency_limit_per_connection(config.server.max_concurrent_requests)
        .add_service(PromptgateServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    gateway.shutdown().await;
    info!("promptgated stopped");
    Ok(())
}

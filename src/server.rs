//! Binary entry point: parses CLI flags, loads configuration, initializes
//! tracing, starts the supervisor and the HTTP listener, and shuts both
//! down cleanly on SIGTERM/SIGINT.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use poem::endpoint::PrometheusExporter;
use poem::listener::TcpListener;
use poem::{EndpointExt, Route};
use prometheus::Registry;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tqserver::config;
use tqserver::proxy::proxy;
use tqserver::supervisor::Supervisor;

#[derive(Parser, Debug)]
#[command(name = "tqserver", about = "Single-node application server fronting child-process workers")]
struct Cli {
    /// Path to the server's YAML configuration file.
    #[arg(long, default_value = "config/server.yaml")]
    config: PathBuf,

    /// Print the effective, fully-merged configuration and exit.
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let server_config = config::load(&cli.config)?;

    if cli.dump_config {
        println!("{}", serde_yaml::to_string(&server_config)?);
        return Ok(());
    }

    init_tracing();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(server_config))
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tqserver=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn async_main(server_config: config::ServerConfig) -> anyhow::Result<()> {
    let prometheus_registry = Registry::new();
    let http_port = server_config.server.port;

    info!(port = http_port, mode = ?server_config.mode, "starting tqserver");

    let supervisor = Supervisor::bootstrap(server_config, &prometheus_registry).await?;
    let proxy_state = supervisor.proxy_state.clone();
    let mut shutdown = supervisor.shutdown_receiver();

    let app = Route::new()
        .nest("/metrics", PrometheusExporter::new(prometheus_registry))
        .at("/*path", proxy)
        .at("/", proxy)
        .data(proxy_state);

    let server = tokio::spawn(async move {
        poem::Server::new(TcpListener::bind(format!("0.0.0.0:{http_port}")))
            .run(app)
            .await
    });

    wait_for_shutdown_signal(&mut shutdown).await;
    supervisor.shutdown().await;

    match server.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(error = %e, "http server exited with error");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "http server task panicked");
            Err(e.into())
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal(_shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal(_shutdown: &mut tokio::sync::watch::Receiver<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    info!("received ctrl-c");
}

use anyhow::Result;
use std::sync::Arc;

use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use gslauncher::{
    broker::spawn_broker,
    config::{Cli, Command, Config, DispatchMode},
    control::ControlPlane,
    dispatch::{ActionExecutor, Dispatcher, HttpClusterControl},
    http::{build_router, cors_layer},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Clusters => print_clusters(&cli.config),
    }
}

fn print_clusters(config: &Config) -> Result<()> {
    let registry = config.load_registry()?;
    for cluster in registry.iter() {
        println!(
            "{}\t{}\t{}",
            cluster.name,
            cluster.resource_id,
            cluster.domain.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn build_executor(config: &Config) -> Result<ActionExecutor> {
    match config.mode {
        DispatchMode::DryRun => Ok(ActionExecutor::Simulated),
        DispatchMode::Production => {
            let Some(base) = config.control_api_base_url.as_deref() else {
                anyhow::bail!("--control-api-base-url is required in production mode");
            };
            let control = HttpClusterControl::new(base, config.control_api_token.clone())?;
            Ok(ActionExecutor::Live(Arc::new(control)))
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let registry = config.load_registry()?;
    let cluster_names = registry.names();
    let executor = build_executor(&config)?;

    let (broker, _broker_task) = spawn_broker(config.broker_options());
    let plane = ControlPlane::new(registry, Dispatcher::new(executor), broker);

    let app = build_router(plane, config.sse_keepalive())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.allowed_origins));

    info!(
        bind = %config.bind,
        mode = config.mode.as_str(),
        clusters = ?cluster_names,
        "starting gslauncher"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).compact().init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

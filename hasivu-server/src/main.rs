//! # HASIVU Server
//!
//! Runs the control plane (`serve`, the default) or executes a single
//! pipeline definition and exits (`pipeline run --file <path>`).

use std::path::PathBuf;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use hasivu_core::pipeline::RunStatus;
use hasivu_server::{
    AppState, create_app,
    infra::config::{ConfigLoad, ConfigLoader, load_pipeline_definition},
};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "hasivu-server")]
#[command(about = "Queue, pipeline and integration control plane")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to the TOML configuration file
    #[arg(long, short, env = "HASIVU_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env when present)
    #[arg(long, env = "HASIVU_ENV_FILE", global = true)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config and environment)
    #[arg(long)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP control plane (default)
    Serve,
    #[command(subcommand)]
    Pipeline(PipelineCommand),
}

#[derive(Debug, Subcommand)]
enum PipelineCommand {
    /// Execute one pipeline definition to completion and exit
    Run {
        /// Pipeline definition (.toml or .json)
        #[arg(long, short)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => run_server(cli.serve).await,
        Some(Command::Pipeline(PipelineCommand::Run { file })) => {
            run_pipeline_once(&cli.serve, &file).await
        }
    }
}

fn load_config(args: &ServeArgs) -> anyhow::Result<ConfigLoad> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &args.env_file {
        loader = loader.with_env_file(path);
    }
    let mut load = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        load.config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        load.config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                // Override via RUST_LOG.
                "info,hasivu::queue=info,hasivu::pipeline=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if load.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &load.metadata.config_path {
        info!(path = %path.display(), "loaded configuration file");
    }
    for warning in &load.warnings {
        warn!("{warning}");
    }

    Ok(load)
}

async fn run_server(args: ServeArgs) -> anyhow::Result<()> {
    let ConfigLoad { config, .. } = load_config(&args)?;
    let addr = config.bind_address();

    let state = AppState::build(config)?;
    let report = state.start().await?;
    info!(
        connected = report.connected.len(),
        failed = report.failed.len(),
        "integration components started"
    );

    let router = create_app(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Starting HASIVU control plane on {addr}");

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("draining background work");
    state.shutdown().await;
    served.context("http server failed")?;
    info!("shutdown complete");
    Ok(())
}

async fn run_pipeline_once(args: &ServeArgs, file: &std::path::Path) -> anyhow::Result<()> {
    let ConfigLoad { mut config, .. } = load_config(args)?;
    let definition = load_pipeline_definition(file)?;
    let pipeline_id = definition.id.clone();
    // Only the requested definition runs; configured ones are not needed.
    config.pipelines.clear();

    let state = AppState::build(config)?;
    state.pipelines.register(definition)?;
    let run = state.pipelines.run(&pipeline_id).await?;
    state.shutdown().await;

    info!(
        pipeline = %pipeline_id,
        run_id = %run.run_id,
        status = ?run.status,
        metrics = ?run.metrics,
        "pipeline run finished"
    );
    println!("{}", serde_json::to_string_pretty(&run)?);

    if run.status != RunStatus::Succeeded {
        if let Some(err) = &run.error {
            error!(pipeline = %pipeline_id, error = %err, "pipeline run did not succeed");
        }
        anyhow::bail!("pipeline {pipeline_id} finished with status {:?}", run.status);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

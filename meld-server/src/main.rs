use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use meld_core::Config;
use meld_observability::{Metrics, NopMetrics, PrometheusMetrics};
use meld_plugin::PluginRegistry;
use meld_proxy::Server;

const FALLBACK_CONFIG_PATH: &str = "./meld.yaml";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "meld", version, about = "meld: fan-out and aggregation API gateway")]
struct Cli {
    /// Path to the YAML configuration file. Falls back to $MELD_CONFIG,
    /// then ./meld.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP gateway.
    Serve,

    /// Validate the configuration file and exit.
    Validate,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config);

    match cli.command {
        Command::Validate => validate(&config_path),
        Command::Serve => serve(&config_path, &cli.log_level),
    }
}

/// RUST_LOG wins, then the config's debug flag, then --log-level.
fn init_tracing(log_level: &str, debug: bool) {
    let fallback = if debug { "debug" } else { log_level };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback)),
        )
        .with_target(false)
        .init();
}

fn resolve_config_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os("MELD_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_PATH))
}

fn validate(config_path: &PathBuf) -> anyhow::Result<()> {
    match Config::load(config_path) {
        Ok(_) => {
            println!("OK");
            Ok(())
        }
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    }
}

fn serve(config_path: &PathBuf, log_level: &str) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;

    init_tracing(log_level, config.debug);

    info!(
        name = %config.name,
        version = %config.version,
        config = %config_path.display(),
        "meld starting"
    );

    let metrics: Arc<dyn Metrics> = if config.server.metrics.enabled {
        match config.server.metrics.provider.as_str() {
            "prometheus" => Arc::new(PrometheusMetrics::new()?),
            other => {
                info!(provider = other, "unknown metrics provider, using no-op sink");
                Arc::new(NopMetrics)
            }
        }
    } else {
        Arc::new(NopMetrics)
    };

    let mut registry = PluginRegistry::new();
    meld_plugins::register_all(&mut registry);
    info!(plugins = registry.len(), "plugins registered");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        // The rate-limiter janitor is spawned during router construction,
        // so the flow graph is built inside the runtime.
        let router = Arc::new(meld_proxy::build_router(&config, &registry, Arc::clone(&metrics))?);

        let shutdown = CancellationToken::new();
        let server = Server::new(&config, router, metrics, shutdown.clone());

        let serve_task = tokio::spawn(async move { server.start().await });

        wait_for_signal().await;
        info!("shutdown signal received");

        shutdown.cancel();

        match tokio::time::timeout(SHUTDOWN_GRACE, serve_task).await {
            Ok(Ok(Ok(()))) => info!("server stopped"),
            Ok(Ok(Err(err))) => error!(error = %err, "server error during shutdown"),
            Ok(Err(err)) => error!(error = %err, "server task failed"),
            Err(_) => error!("graceful shutdown timed out"),
        }

        Ok(())
    })
}

async fn wait_for_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

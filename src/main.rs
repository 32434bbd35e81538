use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nostr_core::{SdkTransport, Transport};
use relay_scout::api::ApiServer;
use relay_scout::discovery::RelayDiscovery;
use relay_scout::store::StateStore;
use relay_scout::{Config, Coordinator};

#[derive(Parser)]
#[command(name = "relay-scout")]
#[command(about = "Nostr topic index and relay discovery service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "relay-scout.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Monitor relays and serve the API
    Run,
    /// Validate configuration and exit
    Test,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    config.expand_paths();

    init_logging(&config.logging.level)?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config, &cli.config).await,
        Commands::Test => test_config(&config),
    }
}

/// A missing file at the default path means built-in defaults.
fn load_config(path: &str) -> Result<Config> {
    let expanded = shellexpand::tilde(path);
    if !std::path::Path::new(expanded.as_ref()).exists() && path == "relay-scout.toml" {
        return Ok(Config::default());
    }
    Config::load_from_file(path).with_context(|| format!("Failed to load config from {}", path))
}

async fn run(config: Config, config_path: &str) -> Result<()> {
    tracing::info!("Starting relay-scout v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Configuration loaded from {}", config_path);

    let store = match &config.store.path {
        Some(path) => Some(StateStore::open(path).with_context(|| "Failed to open state store")?),
        None => None,
    };

    let transport: Arc<dyn Transport> = Arc::new(SdkTransport::new(Duration::from_secs(
        config.ingest.fetch_timeout_secs,
    )));

    let mut coordinator = Coordinator::new(
        config.ingest.clone(),
        config.discovery.clone(),
        transport,
        store,
    )
    .with_context(|| "Failed to create coordinator")?;

    coordinator
        .start()
        .with_context(|| "Failed to start coordinator")?;

    let state = coordinator.state();
    for url in &config.relays.seed {
        if let Err(e) = state.add_relay(url).await {
            tracing::warn!("Skipping seed relay {}: {:#}", url, e);
        }
    }

    let api_server = ApiServer::new(config.api.bind.clone());
    let api_state = coordinator.state();
    tokio::spawn(async move {
        if let Err(e) = api_server.start(api_state).await {
            tracing::error!("API server error: {:#}", e);
        }
    });

    wait_for_shutdown().await?;

    tracing::info!("Received shutdown signal, stopping relay-scout...");
    coordinator
        .shutdown()
        .await
        .with_context(|| "Failed to shutdown coordinator")?;

    Ok(())
}

fn test_config(config: &Config) -> Result<()> {
    println!("Testing configuration...");
    println!("✓ Configuration is valid");

    RelayDiscovery::new(config.discovery.clone())
        .with_context(|| "Discovery settings rejected")?;
    println!("✓ Discovery settings accepted");
    println!("  Seed relays: {}", config.relays.seed.join(", "));

    if let Some(path) = &config.store.path {
        let store = StateStore::open(path).with_context(|| "Failed to open state store")?;
        let restored = store.load()?.is_some();
        println!("✓ State store is readable ({})", path);
        if restored {
            println!("  Saved discovery state found");
        }
    }

    println!("\nConfiguration test completed successfully!");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        },
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        },
        _ = signal::ctrl_c() => {
            tracing::info!("Received Ctrl+C");
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .init();

    Ok(())
}

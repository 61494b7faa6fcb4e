use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use syncwire_agent::{
    JournalContactWriter, ServiceParts, ServiceSettings, StartOutcome, SyncService, telemetry,
};
use syncwire_core::config::{self, Config};
use syncwire_core::event::{BroadcastEventBus, EventBus, EventPayload, EventSource, emit};
use syncwire_core::network::ManualNetworkMonitor;
use syncwire_lifecycle::{ConnectionRegistry, ConnectionStateManager};
use syncwire_storage::{SqliteConfirmationLog, open_confirmation_log};
use tracing::{info, warn};

/// Keeps a device's contacts in sync through the message broker.
#[derive(Parser)]
#[command(name = "syncwire-agent")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is not set (overrides logging.level)
    #[arg(long)]
    log_level: Option<String>,

    /// Seconds between statistics log lines
    #[arg(long, default_value_t = 60)]
    stats_interval: u64,
}

fn load(cli: &Cli) -> Result<Config> {
    let loaded = match &cli.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::load_config(),
    };
    loaded.with_context(|| {
        format!(
            "failed to load configuration from {}",
            cli.config
                .clone()
                .unwrap_or_else(config::config_path)
                .display()
        )
    })
}

fn database_path(config: &Config) -> PathBuf {
    config
        .storage
        .path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config::default_data_dir().join("confirmations.db"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(&cli)?;
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    telemetry::init(level)?;

    info!(version = env!("CARGO_PKG_VERSION"), "syncwire agent starting");

    let db_path = database_path(&config);
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let log = open_confirmation_log(&db_path)
        .await
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    info!(path = %db_path.display(), "confirmation log opened");

    let registry = Arc::new(ConnectionRegistry::from_config(&config.registry));
    registry.clear_all();
    let state = Arc::new(ConnectionStateManager::new(Arc::clone(&registry)));
    let event_bus: Arc<dyn EventBus> =
        Arc::new(BroadcastEventBus::new(config.event_bus.channel_capacity));

    let service: SyncService<JournalContactWriter, SqliteConfirmationLog> = SyncService::new(
        ServiceSettings::from_config(&config),
        ServiceParts {
            writer: Arc::new(JournalContactWriter::new(
                db_path.with_file_name("contacts.jsonl"),
            )),
            log: Arc::new(log),
            network: Arc::new(ManualNetworkMonitor::online()),
            state,
            event_bus: Arc::clone(&event_bus),
        },
    );

    emit(
        event_bus.as_ref(),
        "system.startup.complete",
        EventSource::System("agent".to_string()),
        EventPayload::StartupComplete,
    );

    match service.start().await {
        StartOutcome::Connected => info!(identity = %service.identity(), "consuming"),
        StartOutcome::Retrying => warn!("broker unreachable, retrying in the background"),
        StartOutcome::Rejected => warn!("queue is already claimed, waiting for shutdown"),
    }

    let mut stats = tokio::time::interval(Duration::from_secs(cli.stats_interval.max(1)));
    stats.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    warn!(%error, "failed to listen for ctrl-c");
                }
                break;
            }
            _ = stats.tick() => {
                let snapshot = service.statistics().await;
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(stats = %json, "agent statistics"),
                    Err(error) => warn!(%error, "failed to encode statistics"),
                }
            }
        }
    }

    emit(
        event_bus.as_ref(),
        "system.shutdown.requested",
        EventSource::System("agent".to_string()),
        EventPayload::ShutdownRequested {
            reason: "interrupted".to_string(),
        },
    );
    service.stop().await;
    registry.clear_all();
    info!("syncwire agent stopped");
    Ok(())
}

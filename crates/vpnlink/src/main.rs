//! vpnlink: VPN connectivity agent
//!
//! Loads the agent configuration, starts the connectivity control plane
//! and keeps the tunnel up until Ctrl-C.

mod config;
mod credentials;

use anyhow::{Context, Result};
use clap::Parser;
use config::AgentConfig;
use credentials::StaticCredentials;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vpnlink_control::{
    Collaborators, ConnectivityManager, ConnectivityMonitor, FileSettingsStore, HttpPingProbe,
    LocalProxy, LocationCatalog, LocationId, Notification, StaticLocationsBackend,
};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// vpnlink - VPN connectivity agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (TOML)
    #[arg(short, long, env = "VPNLINK_CONFIG")]
    config: PathBuf,

    /// Select this location before connecting
    #[arg(short, long)]
    location: Option<String>,

    /// Load and measure locations without connecting
    #[arg(long)]
    no_connect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vpnlink=info,vpnlink_control=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = AgentConfig::load(&args.config)?;
    let catalog = LocationCatalog::from_file(&config.catalog_path)
        .with_context(|| format!("loading {}", config.catalog_path.display()))?;

    if let Some(id) = args.location.as_deref() {
        if catalog.find(id).is_none() {
            anyhow::bail!("location {} is not in {}", id, config.catalog_path.display());
        }
    }

    info!("vpnlink starting...");
    info!(
        locations = catalog.locations.len(),
        settings = %config.settings_path.display(),
        "Using static location catalog"
    );

    let connectivity = config.connectivity.clone();
    let manager = ConnectivityManager::new(
        connectivity.clone(),
        Collaborators {
            backend: Arc::new(StaticLocationsBackend::new(catalog)),
            probe: Arc::new(HttpPingProbe::new(connectivity.probe.clone())),
            settings: Arc::new(FileSettingsStore::new(&config.settings_path)),
            credentials: Arc::new(StaticCredentials::from_config(&config)),
            proxy: Arc::new(LocalProxy::new(config.kill_switch).with_port(config.tunnel_port)),
            channel: Arc::new(ConnectivityMonitor::new(connectivity.monitor, config.app_id.clone())),
        },
    );

    let mut events = manager.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(notification) => log_notification(&notification),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Notification log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let locations = manager.refresh_locations().await?;
    info!(count = locations.len(), "Locations ready");

    if let Some(id) = args.location.as_deref() {
        manager.select_location(&LocationId::from(id)).await?;
    }
    manager.start_background_refresh();

    if args.no_connect {
        for location in manager.locations().await {
            info!(location = %location.id, city = %location.city_name, ping = ?location.ping(), "Location");
        }
    } else {
        manager.connect();
    }

    tokio::signal::ctrl_c().await?;
    info!("vpnlink shutting down");

    manager.shutdown().await;
    logger.abort();
    Ok(())
}

fn log_notification(notification: &Notification) {
    match notification {
        Notification::ConnectivityStateChanged { state, context } => {
            info!(%state, retries = context.retry_count, "Connectivity state");
        }
        Notification::ConnectionFail { reason } => warn!(%reason, "Connection attempt failed"),
        Notification::SelectedLocationChanged {
            location_id,
            selected_by_user,
        } => info!(location = %location_id, selected_by_user, "Selected location"),
        Notification::ConnectivityPing { ping } => info!(ping = ?ping, "Channel ping"),
        Notification::ServerError { code, payload } => warn!(%code, %payload, "Server error"),
        Notification::DnsServerSet { dns_server } => info!(%dns_server, "DNS server set"),
        other => tracing::debug!(event = other.name(), "Notification"),
    }
}

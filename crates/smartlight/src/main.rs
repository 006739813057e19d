use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use smartlight::api;
use smartlight::Config;
use smartlight::ConnectionManager;
use smartlight::DeviceChannel;
use smartlight::Notifier;
use smartlight::RumqttcClient;
use smartlight::Session;
use smartlight::Topics;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_CONFIG: &str = "smartlight.toml";

/// Smart light controller
#[derive(Parser, Debug)]
#[command(name = "smartlight")]
#[command(version)]
struct Args {
    /// Path to the TOML config file (defaults to ./smartlight.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Device to control, overriding `device.id` from the config
    #[arg(short, long)]
    device: Option<String>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::from_file(DEFAULT_CONFIG)
            .with_context(|| format!("Failed to load config from {}", DEFAULT_CONFIG))?,
        None => Config::default(),
    };

    if let Some(device) = &args.device {
        config.device.id = device.clone();
        config.validate().context("Invalid --device")?;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(config.logging.level))
        .init();

    tracing::info!("smartlight starting");
    tracing::info!(
        "Broker {}:{}, device {} under {}",
        config.broker.host,
        config.broker.port,
        config.device.id,
        config.device.topic_base
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = RumqttcClient::new(
        &config.broker,
        config.broker.generate_client_id(),
        events_tx,
    );
    let client_id = transport.client_id();
    tracing::debug!("MQTT client id {}", client_id);

    let manager = ConnectionManager::new(transport, events_rx);
    let topics = Topics::new(config.device.topic_base.clone());
    let channel = DeviceChannel::new(manager.clone(), topics);
    let (notifier, notifications) = Notifier::channel();
    let session = Session::new(
        manager,
        channel,
        &config.session,
        config.device.id.clone(),
        notifier,
    );

    // Log every snapshot change
    let mut snapshots = session.subscribe_snapshot();
    let snapshot_logger = tokio::spawn(async move {
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            tracing::info!("Light: {:?}", snapshot);
        }
    });

    session.start();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (server, collector) = if config.api.enabled {
        let inbox = api::NotificationInbox::new();
        let collector = inbox.collect(notifications);
        let state = api::AppState::new(session.clone(), inbox, client_id);
        let listen = config.api.listen.clone();
        let port = config.api.port;
        let server = tokio::spawn(async move {
            if let Err(e) = api::serve(&listen, port, state, shutdown_rx).await {
                tracing::error!("HTTP API server failed: {}", e);
            }
        });
        (Some(server), collector)
    } else {
        tracing::info!("HTTP API disabled; notifications are only logged");
        // The notifier logs each notification; drain the channel
        let mut notifications = notifications;
        let collector = tokio::spawn(async move { while notifications.recv().await.is_some() {} });
        (None, collector)
    };

    tracing::info!("Press Ctrl+C to exit");

    // Wait for Ctrl+C
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received shutdown signal");
        }
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    let _ = shutdown_tx.send(());
    if let Err(e) = session.shutdown().await {
        tracing::error!("Error disconnecting from broker: {}", e);
    }

    if let Some(server) = server {
        if let Err(e) = server.await {
            tracing::error!("HTTP API task failed: {}", e);
        }
    }
    collector.abort();
    snapshot_logger.abort();

    tracing::info!("smartlight shutdown complete");

    Ok(())
}

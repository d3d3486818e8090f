//! binwatch daemon: monitors bin fill levels over MQTT and dispatches
//! emptying commands, persisting everything to SQLite.

mod config;

use std::future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use binwatch_bus_mqtt::MqttBus;
use binwatch_core::ingest::IngestError;
use binwatch_core::router::{EventRouter, RouterError};
use binwatch_core::wire::RawMessage;
use binwatch_store_sqlite::SqliteStore;

use crate::config::DaemonConfig;

/// Time allowed for the offline announcement and disconnect to reach the broker.
const FLUSH_GRACE: Duration = Duration::from_secs(3);

/// Smart bin fill-level monitor.
#[derive(Parser, Debug)]
#[command(name = "binwatch")]
#[command(about = "Monitor bin fill levels and dispatch emptying commands over MQTT")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE", env = "BINWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "debug,sqlx=warn,rumqttc=info"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = DaemonConfig::load(cli.config.as_deref()).unwrap_or_else(|err| {
        warn!(error = %err, "failed to load config, using defaults");
        DaemonConfig::default()
    });
    info!(
        store = %config.store.path.display(),
        broker = %config.broker.host,
        port = config.broker.port,
        warn_threshold = config.engine.warn_threshold,
        critical_threshold = config.engine.critical_threshold,
        "configuration loaded"
    );

    let store = SqliteStore::connect(&config.store.path)
        .await
        .context("failed to open the persistence store")?;

    let (bus, event_loop) = MqttBus::connect(&config.broker);
    let router = Arc::new(EventRouter::new(
        Arc::new(store),
        Arc::new(bus.clone()),
        config.engine,
        config.ingest,
        &config.router,
    ));

    let shutdown = CancellationToken::new();
    let connection = CancellationToken::new();
    let (sink, mut inbound) = mpsc::unbounded_channel();
    let mqtt = tokio::spawn(event_loop.run(sink, connection.clone()));

    router
        .recover(Utc::now())
        .await
        .context("failed to recover persisted state")?;

    let sweeper = tokio::spawn(sweep_loop(
        Arc::clone(&router),
        config.router.sweep_interval(),
        shutdown.clone(),
    ));

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    info!("binwatch running");
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            message = inbound.recv() => match message {
                Some(raw) => forward(&router, &raw).await,
                None => {
                    error!("mqtt event loop ended unexpectedly");
                    shutdown.cancel();
                    break;
                }
            },
        }
    }

    if let Err(err) = sweeper.await {
        warn!(error = %err, "sweep task failed");
    }
    router.shutdown().await;

    drop(inbound);
    if let Err(err) = bus.announce(false).await {
        warn!(error = %err, "offline announcement failed");
    }
    if let Err(err) = bus.disconnect().await {
        warn!(error = %err, "disconnect request failed");
    }
    if timeout(FLUSH_GRACE, mqtt).await.is_err() {
        connection.cancel();
        warn!("mqtt connection did not close in time");
    }

    info!("binwatch shutdown complete");
    Ok(())
}

async fn forward(router: &EventRouter, raw: &RawMessage) {
    match router.handle_message(raw, Utc::now()).await {
        Ok(_receipt) => {}
        Err(RouterError::Ingest(IngestError::Duplicate { .. } | IngestError::Malformed(_))) => {}
        Err(RouterError::Unroutable(topic)) => debug!(topic = %topic, "ignoring unroutable message"),
        Err(err) => warn!(topic = %raw.topic, error = %err, "inbound message rejected"),
    }
}

async fn sweep_loop(router: Arc<EventRouter>, period: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                router.sweep(Utc::now()).await;
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl+C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

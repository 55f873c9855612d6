//! Prometheus exporter for collectd.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use collectd_exporter::{
    AppState, BinaryListener, Exporter, ExporterConfig, HttpServer, Ingestor, LastPush,
    MetricStore, TypesDb, spawn_sweeper,
};

/// Prometheus exporter for collectd.
#[derive(Parser, Debug)]
#[command(name = "collectd-exporter")]
#[command(about = "Export collectd metrics for Prometheus scraping")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// UDP address for the collectd binary protocol (overrides config).
    #[arg(long)]
    collectd_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        ExporterConfig::load_from_file(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path))?
    } else {
        ExporterConfig::default()
    };

    if let Some(listen) = args.listen {
        config.web.listen = listen;
    }
    if let Some(listen) = args.collectd_listen {
        config.collectd.listen = Some(listen);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    collectd_common::init_tracing(&config.logging)?;

    info!("Starting collectd exporter");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared state
    let store = Arc::new(MetricStore::with_capacity_limit(config.store.max_entries));
    let last_push = Arc::new(LastPush::new());
    let ingestor = Arc::new(Ingestor::new(store.clone(), last_push.clone()));
    let exporter = Arc::new(Exporter::new(
        store.clone(),
        last_push,
        config.exporter.prefix.clone(),
        config.exporter.default_labels.clone(),
    ));

    let typesdb = match &config.collectd.typesdb_file {
        Some(path) => {
            let db = TypesDb::load_from_file(path)
                .with_context(|| format!("Failed to load types.db from {}", path.display()))?;
            info!(types = db.len(), path = %path.display(), "Loaded types.db");
            Some(Arc::new(db))
        }
        None => None,
    };

    // Bind every listener before serving anything
    let mut state = AppState::new(ingestor.clone(), exporter);

    let binary_listener = match &config.collectd.listen {
        Some(_) => {
            let listener = BinaryListener::bind(&config.collectd)?;
            state = state.with_listener_stats(listener.stats());
            Some(listener)
        }
        None => None,
    };

    let listen_addr: SocketAddr = config
        .web
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;
    let http_server = HttpServer::bind(listen_addr, state, &config.web).await?;

    // Start sweeper
    let sweeper_task = spawn_sweeper(
        store.clone(),
        Duration::from_secs(config.store.sweep_interval_secs),
        shutdown_rx.clone(),
    );

    // Start binary listener; its failure ends the process
    let (listener_failed_tx, mut listener_failed_rx) = watch::channel(false);
    let listener_task = binary_listener.map(|listener| {
        let ingestor = ingestor.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let result = listener.run(ingestor, typesdb, shutdown).await;
            if let Err(e) = &result {
                error!("collectd listener error: {:#}", e);
                let _ = listener_failed_tx.send(true);
            }
            result
        })
    });

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    let mut listener_failed = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = async {
            #[cfg(unix)]
            {
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                    }
                    Err(e) => {
                        error!("Failed to install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("Received SIGTERM, shutting down...");
        }
        Ok(_) = listener_failed_rx.wait_for(|failed| *failed) => {
            error!("collectd listener stopped, shutting down");
            listener_failed = true;
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if let Some(task) = listener_task {
            let _ = task.await;
        }
        let _ = http_task.await;
        let _ = sweeper_task.await;
    })
    .await;

    // Print final stats
    let stats = ingestor.stats();
    info!(
        samples_received = stats.samples_received,
        samples_accepted = stats.samples_accepted,
        samples_rejected = stats.samples_rejected,
        values_skipped = stats.values_skipped,
        entries = store.len(),
        entries_evicted = store.stats().entries_evicted,
        "Final statistics"
    );

    if listener_failed {
        anyhow::bail!("collectd listener failed");
    }

    info!("Exporter stopped");
    Ok(())
}

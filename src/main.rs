//! Inventory Relay - inventory sync API with a write-behind buffer
//!
//! Game clients post inventory snapshots at high rate. Snapshots land in a
//! Redis buffer and are drained to SQLite or PostgreSQL in small batches, so
//! the database only ever sees a bounded write load.

mod buffer;
mod cleanup;
mod config;
mod db;
mod inventory;
mod model;
mod web;

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::buffer::{InventoryBuffer, MemoryStore};
use crate::cleanup::CleanupScheduler;
use crate::config::Config;
use crate::inventory::{InventoryService, RepositoryFlusher};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (before any other initialization)
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    init_logging(&config);

    info!("Starting Inventory Relay...");

    let storage = db::open(&config.database).await?;
    info!("Storage initialized ({})", storage.inventory.backend());

    let flusher = Arc::new(RepositoryFlusher::new(storage.inventory.clone()));
    let buffer_settings = config.buffer.settings();
    let buffer = match config.buffer.driver.as_str() {
        "memory" => {
            warn!("Using in-process buffer; pending writes are lost if the process dies");
            Some(InventoryBuffer::start(Arc::new(MemoryStore::new()), flusher, buffer_settings).await?)
        }
        _ => match InventoryBuffer::connect(&config.buffer.redis_url, flusher, buffer_settings).await {
            Ok(buffer) => Some(buffer),
            Err(e) => {
                warn!("Redis buffer unavailable, writing straight to storage: {}", e);
                None
            }
        },
    };

    let inventory = InventoryService::new(
        storage.inventory.clone(),
        storage.owners.clone(),
        buffer.clone(),
    );
    info!("Inventory service ready (buffered={})", inventory.is_buffered());

    let cleanup = Arc::new(CleanupScheduler::new(
        storage.inventory.clone(),
        config.cleanup.settings(),
    ));
    if config.cleanup.enabled {
        cleanup.start();
    } else {
        info!("Inventory cleanup disabled");
    }

    let state = Arc::new(web::AppState {
        inventory,
        buffer: buffer.clone(),
        repo: storage.inventory.clone(),
        cleanup: cleanup.clone(),
        started_at: Utc::now(),
    });

    let served = web::start_server(&config, state, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("HTTP server failed: {}", e);
    }

    // Drain pending writes before the database goes away
    if let Some(buffer) = buffer {
        buffer.stop().await;
    }
    cleanup.stop().await;
    storage.inventory.close().await;

    info!("Inventory Relay stopped");
    served
}

/// Use LOG_FORMAT=gcp for structured GCP Cloud Logging. RUST_LOG overrides
/// the configured level.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "gcp" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
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

    info!("Shutdown signal received");
}

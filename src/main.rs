// src/main.rs
mod api;
mod auth;
mod config;
mod db;
mod error;
mod ledger;
mod lock;
mod memory;
mod models;
mod replay;
mod settlement;
mod validate;

use crate::config::{Config, StorageKind};
use crate::db::{ScyllaStore, Store};
use crate::ledger::Ledger;
use crate::memory::MemoryStore;
use env_logger::{Builder, Env};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return;
        }
    };
    Builder::from_env(Env::default().default_filter_or(config.log_level.as_str()))
        .format_timestamp_secs()
        .init();

    // Initialize storage
    let store: Arc<dyn Store> = match config.storage {
        StorageKind::Scylla => match ScyllaStore::init(&config.scylla_node).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                return;
            }
        },
        StorageKind::Memory => {
            info!("Using in-memory storage; data is lost on exit.");
            Arc::new(MemoryStore::new())
        }
    };

    info!("Starting the stock ledger application...");
    let ledger = Arc::new(Ledger::new(store));
    let port = config.port;
    let api = api::routes(ledger, Arc::new(config));

    // Start the server
    info!("Server running on http://0.0.0.0:{}", port);
    warp::serve(api).run(([0, 0, 0, 0], port)).await;
}

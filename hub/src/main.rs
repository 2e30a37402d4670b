mod aggregate;
mod batching;
mod config;
mod consolidate;
mod dispatch;
mod errors;
mod ingest;
mod metrics;
mod model;
mod mqtt;
mod projector;
mod rest;
mod rules;
mod scheduler;
mod store;
#[cfg(test)]
mod testing;

use axum::{routing::get, Router};
use config::{Config, StoreBackend};
use dispatch::{Dispatcher, HttpDispatcher};
use ingest::Ingestor;
use rules::RuleEngine;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryStore, PgStore, Store};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env();

    info!("Starting home automation hub");
    info!("HTTP server: {}", config.http_addr);
    if config.mqtt_enabled {
        info!("MQTT broker: {}:{}", config.mqtt_broker, config.mqtt_port);
    }

    if let Err(e) = metrics::init_metrics() {
        error!("Failed to register metrics: {}", e);
    }

    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Memory => {
            warn!("Using in-memory store, nothing will survive a restart");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Postgres => {
            info!(
                "Database: {}",
                config.database_url.split('@').last().unwrap_or("***")
            );
            match PgStore::connect(&config.database_url).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    error!("Failed to connect to database: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    let dispatcher: Arc<dyn Dispatcher> = match HttpDispatcher::new(
        Duration::from_millis(config.dispatch_timeout_ms),
        config.controller_port,
    ) {
        Ok(dispatcher) => Arc::new(dispatcher),
        Err(e) => {
            error!("Failed to build controller HTTP client: {}", e);
            std::process::exit(1);
        }
    };

    let engine = Arc::new(RuleEngine::new(Arc::clone(&store), Arc::clone(&dispatcher)));

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let ingestor = Arc::new(Ingestor::new(Arc::clone(&store), Arc::clone(&engine), tx));

    let mqtt_handle = if config.mqtt_enabled {
        let client_id = format!("hub-{}", uuid::Uuid::new_v4());
        let (broker, port) = (config.mqtt_broker.clone(), config.mqtt_port);
        let mqtt_ingestor = Arc::clone(&ingestor);
        tokio::spawn(async move {
            if let Err(e) = mqtt::run_mqtt(broker, port, client_id, mqtt_ingestor).await {
                error!("MQTT task failed: {}", e);
            }
        })
    } else {
        info!("MQTT disabled, accepting reports over HTTP only");
        tokio::spawn(std::future::pending::<()>())
    };

    let batcher_store = Arc::clone(&store);
    let (batch_size, batch_timeout_ms) = (config.batch_size, config.batch_timeout_ms);
    let batcher_handle = tokio::spawn(async move {
        batching::run_batcher(rx, batcher_store, batch_size, batch_timeout_ms).await;
    });

    let scheduler_handle = tokio::spawn(scheduler::run_scheduler(
        Arc::clone(&engine),
        config.schedule_tick_secs,
    ));

    let state = rest::AppState {
        store,
        engine,
        ingestor,
        dispatcher,
    };
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(state));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = mqtt_handle => {
            error!("MQTT task terminated");
        }
        _ = batcher_handle => {
            error!("Batcher task terminated");
        }
        _ = scheduler_handle => {
            error!("Schedule clock terminated");
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
}

async fn metrics_handler() -> String {
    metrics::gather_metrics()
}

//! roomserverd - the room-state engine of a federated chat homeserver.
//!
//! Consumes room events from a partitioned input log, computes and stores
//! the state of the room before each event, resolves state conflicts
//! between divergent graph edges, and publishes authoritative state
//! deltas to an output log. A small HTTP surface serves read-only state
//! queries and Prometheus metrics.

mod config;
mod db;
mod error;
mod http;
mod input;
mod metrics;
mod output;
mod query;
mod stream;
mod telemetry;
mod types;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::db::Database;
use crate::input::Consumer;
use crate::query::QueryApi;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    // Load configuration from the environment
    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load config");
        e
    })?;

    info!(
        database = %config.database,
        input_topic = %config.input_topic,
        output_topic = %config.output_topic,
        bind_address = %config.bind_address,
        "Starting roomserverd"
    );

    metrics::register_metrics();

    // Initialize the store and the broker connection
    let db = Database::new(&config.database).await?;
    let broker = stream::open_broker(&config.broker_uris)?;

    let cancel = CancellationToken::new();

    // Start the ingress consumer
    let consumer = Consumer::new(
        db.clone(),
        broker.as_ref(),
        &config.input_topic,
        &config.output_topic,
        config.stop_after,
        cancel.clone(),
    );
    let consumer_task = tokio::spawn(consumer.run());

    // Start the query/metrics HTTP listener
    let http_task = tokio::spawn(http::run_http_server(
        config.bind_address,
        QueryApi::new(db),
        cancel.clone(),
    ));

    // Run until interrupted or until the consumer stops (stop-after
    // budget or fatal store error).
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            cancel.cancel();
        }
        result = consumer_task => {
            cancel.cancel();
            match result {
                Ok(Ok(())) => info!("Consumer finished"),
                Ok(Err(e)) => {
                    error!(error = %e, "Consumer aborted");
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    if let Err(e) = http_task.await? {
        error!(error = %e, "HTTP server error");
    }
    info!("Shutdown complete");
    Ok(())
}

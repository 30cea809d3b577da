//! evolving-node server binary.

use std::sync::Arc;

use evolving_node::config::Config;
use evolving_node::{handlers, Dispatcher, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        outbound_capacity = config.outbound_capacity,
        workers = ?config.workers,
        "Starting evolving-node"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    let dispatcher = Arc::new(Dispatcher::new());
    handlers::install(&dispatcher);
    let server = Server::new(config, dispatcher);

    runtime.block_on(server.run())?;
    Ok(())
}

//! mudskipper: a minimal multi-client MUD server skeleton.
//!
//! Features:
//! - Line-oriented command protocol over TCP (echo, quit, copyover)
//! - One session task per connection, throttled by a shared game tick
//! - Graceful shutdown on SIGINT/SIGQUIT/SIGTERM with session drain
//! - Zero-downtime restart ("copyover"): the listener and every live
//!   client socket are handed to a freshly exec'd process without
//!   dropping a connection

mod commands;
mod config;
mod copyover;
mod registry;
mod server;
mod session;

use commands::CommandTable;
use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        tick_millis = config.tick_millis,
        copyover_fds = config.copyover_fds,
        "Starting mudskipper"
    );

    let server = Server::new(config, CommandTable::builtin());
    server.run().await?;

    info!("Exiting");
    Ok(())
}

//! dualkv: an in-memory key-value server with two interchangeable runtimes
//!
//! The server speaks a length-prefixed binary protocol with three commands:
//! `get`, `set` and `del`. Connections are served either by:
//! - a single-threaded mio event loop (epoll on Linux, kqueue on macOS)
//! - a thread-per-connection runtime over a mutex-guarded store
//!
//! Passing `--connect ADDR` starts an interactive client instead.
//! Configuration comes from CLI arguments or a TOML file.

mod client;
mod config;
mod protocol;
mod runtime;
mod storage;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(addr) = config.connect.as_deref() {
        client::repl(addr)?;
        return Ok(());
    }

    info!(
        host = %config.host,
        port = config.port,
        architecture = ?config.architecture,
        max_connections = config.max_connections,
        "Starting dualkv server"
    );

    runtime::run(config)?;
    Ok(())
}

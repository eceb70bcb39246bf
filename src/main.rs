//! chat: a broadcast chat server and client
//!
//! Messages travel over TCP as a 2-byte big-endian length followed by the
//! payload. The server relays every message it receives to all other
//! connected clients; the client sends its input lines and prints whatever
//! the server relays.
//!
//! Features:
//! - Single-threaded readiness loop for both roles
//! - Bounded client table with a rejection notice when full
//! - Idle timeout and signal-driven shutdown
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod runtime;

use config::{ClientConfig, Config, Role, ServerConfig};
use signal_hook::consts::{SIGINT, SIGTERM};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout carries chat output in client mode
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

    match config.role {
        Role::Server(server) => run_server(server, shutdown),
        Role::Client(client) => run_client(client, shutdown),
    }
}

fn run_server(
    config: ServerConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        host = %config.host,
        port = config.port,
        max_clients = config.max_clients,
        idle_timeout_secs = config.idle_timeout.map(|t| t.as_secs()).unwrap_or(0),
        "Starting chat server"
    );

    let mut server = runtime::Server::bind(&config, shutdown)?;
    server.run()?;
    Ok(())
}

fn run_client(
    config: ClientConfig,
    shutdown: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(host = %config.host, port = config.port, "Starting chat client");

    let mut client =
        runtime::Client::connect(&config, libc::STDIN_FILENO, std::io::stdout(), shutdown)?;
    client.run()?;
    Ok(())
}

//! aesdsocket: a line-framed append-and-playback TCP server
//!
//! Each client's bytes are appended to a data file as they arrive. When a
//! chunk ends in a newline the whole file is sent back to that client, the
//! connection is closed and the file is cleared for the next client.
//!
//! Features:
//! - Strictly serial service, one client at a time
//! - Graceful shutdown on SIGINT/SIGTERM, removing the data file
//! - Optional daemon mode (`-d`)
//! - Configuration via CLI arguments or TOML file

mod config;
mod daemon;
mod error;
mod server;
mod session;
mod shutdown;
mod storage;

use config::Config;
use error::SetupError;
use server::Server;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("aesdsocket: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        store = %config.store_path.display(),
        daemon = config.daemon,
        "Starting aesdsocket"
    );

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(op = e.operation(), error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

/// Bind, optionally detach, install signal handlers and serve until shutdown.
fn run(config: Config) -> Result<(), SetupError> {
    let server = Server::bind(&config)?;

    if config.daemon {
        daemon::detach().map_err(SetupError::Daemon)?;
    }

    let _signals =
        shutdown::install_signal_handlers(server.shutdown_handle()).map_err(SetupError::Signal)?;

    server.run();
    Ok(())
}

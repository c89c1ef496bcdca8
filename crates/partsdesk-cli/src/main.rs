//! partsdesk - command-line access to the back-office API.
//!
//! Logs in against the backend, keeps the token pair in durable storage and
//! forwards arbitrary authenticated requests, refreshing expired tokens on
//! the way.

mod commands;

use std::io;

use anyhow::Result;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::Command;

const USAGE: &str = "\
Usage: partsdesk <command> [args]

Commands:
  login [email]                       Log in and store the session
  logout                              Forget the stored session
  status                              Show whether a session is active
  get <path>                          Authenticated GET, prints the JSON response
  request <METHOD> <path> [json-body] Authenticated request with any method

Environment:
  PARTSDESK_API_URL   Override the configured API base URL
  RUST_LOG            Log filter (default: warn)";

/// Initialize the tracing subscriber for logging
fn init_tracing() -> WorkerGuard {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (writer, guard) = tracing_appender::non_blocking(io::stderr());
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer))
        .with(filter)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match Command::parse(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if matches!(command, Command::Help) {
        println!("{}", USAGE);
        return Ok(());
    }

    info!(?command, "partsdesk starting");
    commands::run(command).await
}

//! collabd - collaborative workspace coordinator.
//!
//! Usage:
//!   collabd serve [--port 3002] --jwt-secret <secret>   # Start HTTP/WebSocket server
//!
//! Every flag can also be set through its environment variable or a `.env`
//! file in the working directory.

use clap::{Parser, Subcommand};
use collabd::config::{Config, ServeArgs};
use collabd::http_server;
use collabd::state::AppState;
use std::process::exit;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collabd")]
#[command(about = "Presence, file locks, sandboxes and terminals for collaborative editing")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            let config = match Config::try_from(serve) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(2);
                }
            };
            let state = match AppState::from_config(&config).await {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "startup failed");
                    exit(1);
                }
            };
            if let Err(e) =
                http_server::run_server(config.listen_addr, &config.allowed_origins, state).await
            {
                error!(error = %e, "server failed");
                exit(1);
            }
        }
    }
}

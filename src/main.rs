//! vc - Collection Versioning CLI
//!
//! A standalone CLI that brings git-like version control to MongoDB
//! collections: register, checkout, branch, stash, diff, push/pull and
//! conflict resolution.

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vc::cli::Cli;
use vc::output::emit_error;

#[tokio::main]
async fn main() {
    // Tracing is opt-in via RUST_LOG.
    // Keep startup robust in CI environments: ignore invalid/huge filters.
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|raw| {
            let raw = raw.trim();
            if raw.is_empty() || raw.len() > 4096 {
                return None;
            }
            EnvFilter::try_new(raw).ok()
        })
        .unwrap_or_else(|| EnvFilter::new("off"));

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let command = std::env::args().nth(1).unwrap_or_else(|| "vc".to_string());
    let cli = Cli::parse();
    let json = cli.json;
    if let Err(err) = cli.run().await {
        let _ = emit_error(&command, &err, json);
        std::process::exit(err.exit_code());
    }
}

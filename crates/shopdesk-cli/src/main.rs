//! Shopdesk - command-line admin console.
//!
//! Lists and approves shops, orders and redemption requests through the
//! admin API. The signed-in session is persisted between runs.

mod args;
mod commands;
mod endpoints;

use std::io;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use shopdesk_core::{Config, Console};

use args::{Cli, Commands};
use commands::Ctx;
use endpoints::Endpoints;

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();
    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = base_url;
    }

    let store = config.open_store()?;
    let console = Console::init(config.console_config()?, store).await?;
    let ctx = Ctx {
        console,
        endpoints: Endpoints::build()?,
    };
    info!(base_url = %config.base_url, "Shopdesk starting");

    match cli.command {
        Commands::Login { username, password } => commands::login(&ctx, username, password).await?,
        Commands::Logout => commands::logout(&ctx).await?,
        Commands::Whoami => commands::whoami(&ctx).await?,
        Commands::Shops(cmd) => commands::shops(&ctx, cmd.action).await?,
        Commands::Orders(cmd) => commands::orders(&ctx, cmd.action).await?,
        Commands::Redemptions(cmd) => commands::redemptions(&ctx, cmd.action).await?,
        Commands::Watch { resource, interval } => {
            commands::watch(&ctx, resource, Duration::from_secs(interval.max(1))).await?
        }
    }

    Ok(())
}

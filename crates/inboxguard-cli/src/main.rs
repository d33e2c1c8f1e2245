//! CLI entry point for InboxGuard.
//!
//! The `inboxguard` binary connects a Gmail account, reports the health of
//! the vault and the account, and keeps tokens rotated while it runs.

mod app;
mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::app::App;
use crate::cli::{Cli, Commands};
use crate::config::{AppConfig, LogConfig, LogFormat};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (path, explicit) = cli.config_path();
    let config = AppConfig::load(&path, explicit)?;
    init_tracing(&config.log);

    let app = App::build(config).await?;
    match cli.command {
        Commands::Status => cmd_status(&app).await,
        Commands::Connect { force, scopes } => cmd_connect(&app, force, &scopes).await,
        Commands::Disconnect => cmd_disconnect(&app).await,
        Commands::Run => cmd_run(&app).await,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn cmd_status(app: &App) -> Result<()> {
    let report = app.status().await?;
    print_json(&report)
}

async fn cmd_connect(app: &App, force: bool, scopes: &[String]) -> Result<()> {
    let profile = app.connect(force, scopes).await?;
    println!(
        "Connected {} ({} messages, {} threads)",
        profile.email_address, profile.messages_total, profile.threads_total
    );
    Ok(())
}

async fn cmd_disconnect(app: &App) -> Result<()> {
    let outcome = app.disconnect().await?;
    print_json(&outcome)?;
    if !outcome.is_complete() {
        tracing::warn!(%outcome, "some stored entries could not be removed");
    }
    Ok(())
}

async fn cmd_run(app: &App) -> Result<()> {
    tracing::info!("InboxGuard running, press Ctrl-C to stop");
    app.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
    })
    .await
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}

/// Initialize the tracing subscriber with env-filter support.
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match config.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

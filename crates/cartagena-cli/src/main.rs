//! CLI entry point for Cartagena.
//!
//! This binary provides the `cartagena` command: an interactive console that
//! drives the Twitch bot, and a one-shot `login` subcommand.

mod bot;
mod chat;
mod cli;
mod config;
mod helpers;
mod login;
mod repl;
mod secret;

use anyhow::Result;
use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::config::BotSettings;
use crate::helpers::{init_tracing, load_dotenv};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing("info");
    load_dotenv();

    let settings = BotSettings::load(&cli.config);
    tracing::debug!(
        config = %cli.config.display(),
        client_id = %settings.client_id,
        redirect_uri = %settings.redirect_uri,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => repl::cmd_run(settings).await,
        Commands::Login => login::cmd_login(settings).await,
    }
}

//! CLI argument definitions for Cartagena.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// Cartagena -- a Twitch chat bot.
#[derive(Parser)]
#[command(
    name = "cartagena",
    version,
    about = "Cartagena -- Twitch chat bot",
    long_about = "A Twitch chat bot that logs in through your browser, joins chat and \
                  keeps its access token fresh in the background."
)]
pub struct Cli {
    /// Path to the TOML config file (`[twitch]` section).
    #[arg(long, short, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the interactive console (default).
    Run,

    /// Log in once through the browser, print the identity and exit.
    Login,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Subcommand: `cartagena run` -- interactive console.
//!
//! Reads one command per line. Commands are case-insensitive:
//!
//! - `secret`                -- enter the client secret (masked)
//! - `twitchbot start|stop`  -- start or stop the chat bot
//! - `status`                -- show session and bot state
//! - `help`                  -- list commands
//! - `quit` / `exit`         -- stop the bot and leave

use std::io::{self, Write as _};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use cartagena_auth::{AuthService, ClientSecret};

use crate::bot::TwitchBot;
use crate::chat::ChatClient;
use crate::config::{BotSettings, secret_from_env};
use crate::secret::read_secret;

const SECRET_PROMPT: &str = "Enter your Twitch App's CLIENT SECRET:";

// ---------------------------------------------------------------------------
// Command parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotAction {
    Start,
    Stop,
    /// `twitchbot` without a subcommand.
    Usage,
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Secret,
    TwitchBot(BotAction),
    Status,
    Help,
    Quit,
    Unknown(String),
}

/// Parse one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    let name = parts.next()?;

    let command = match name.to_lowercase().as_str() {
        "secret" => Command::Secret,
        "twitchbot" => Command::TwitchBot(match parts.next() {
            None => BotAction::Usage,
            Some(sub) => match sub.to_lowercase().as_str() {
                "start" => BotAction::Start,
                "stop" => BotAction::Stop,
                _ => BotAction::Unknown(sub.to_string()),
            },
        }),
        "status" => Command::Status,
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(name.to_string()),
    };
    Some(command)
}

// ---------------------------------------------------------------------------
// Console state
// ---------------------------------------------------------------------------

/// Whether the loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Console {
    settings: BotSettings,
    secret: Option<ClientSecret>,
    bot: Option<TwitchBot>,
}

impl Console {
    pub fn new(settings: BotSettings, secret: Option<ClientSecret>) -> Self {
        Self {
            settings,
            secret,
            bot: None,
        }
    }

    pub async fn dispatch(&mut self, command: Command) -> Flow {
        match command {
            Command::Secret => self.cmd_secret().await,
            Command::TwitchBot(action) => self.cmd_twitchbot(action).await,
            Command::Status => self.cmd_status().await,
            Command::Help => print_help(),
            Command::Quit => return Flow::Exit,
            Command::Unknown(name) => println!("Unknown command: {name}"),
        }
        Flow::Continue
    }

    async fn cmd_secret(&mut self) {
        let entered = tokio::task::spawn_blocking(|| read_secret(SECRET_PROMPT)).await;
        match entered {
            Ok(Ok(secret)) if !secret.is_empty() => {
                self.secret = Some(secret);
                // A stopped bot still holds the old secret.
                if self.bot.as_ref().is_some_and(|b| !b.is_running()) {
                    self.bot = None;
                }
                println!("Client secret set.");
            }
            Ok(Ok(_)) => println!("Client secret not changed (empty input)."),
            Ok(Err(e)) => println!("{e}"),
            Err(e) => error!(error = %e, "secret prompt task failed"),
        }
    }

    async fn cmd_twitchbot(&mut self, action: BotAction) {
        if action == BotAction::Usage {
            print_bot_usage();
            return;
        }

        let connected = match &self.bot {
            Some(bot) => bot.is_connected().await,
            None => false,
        };
        if !connected {
            println!("Bot is not connected or not authenticated!");
        }

        match action {
            BotAction::Start => {
                let Some(secret) = self.secret.clone() else {
                    println!("Client Secret not set! Do 'secret'");
                    return;
                };
                if let Err(e) = self.start_bot(secret).await {
                    println!("Failed to start bot: {e:#}");
                }
            }
            BotAction::Stop => {
                let stopped = match self.bot.as_mut() {
                    Some(bot) => bot.stop().await,
                    None => false,
                };
                if !stopped {
                    println!("Bot is not running.");
                }
            }
            BotAction::Unknown(sub) => {
                println!("Unknown subcommand: {sub}");
                print_bot_usage();
            }
            BotAction::Usage => {}
        }
    }

    async fn start_bot(&mut self, secret: ClientSecret) -> Result<()> {
        let bot = match self.bot.take() {
            Some(bot) => bot,
            None => {
                let service = AuthService::new(self.settings.auth_config(secret))
                    .context("invalid Twitch configuration")?;
                let chat = ChatClient::new(self.settings.irc_url.clone());
                TwitchBot::new(
                    Arc::new(service),
                    Arc::new(chat),
                    self.settings.channel.clone(),
                )
            }
        };
        self.bot.insert(bot).start().await
    }

    async fn cmd_status(&self) {
        println!();
        println!("  Cartagena Status");
        println!("  ================");
        println!(
            "  Client secret:  {}",
            if self.secret.is_some() { "set" } else { "NOT SET (run `secret`)" }
        );

        let Some(bot) = &self.bot else {
            println!("  Bot:            not started");
            println!();
            return;
        };

        let snapshot = bot.service().snapshot();
        println!(
            "  Bot:            {}",
            if bot.is_running() { "running" } else { "stopped" }
        );
        println!(
            "  Chat:           {}",
            if bot.is_connected().await { "connected" } else { "disconnected" }
        );
        match snapshot.user_login() {
            Some(login) => println!("  Logged in as:   {login}"),
            None => println!("  Logged in as:   -"),
        }
        match snapshot.expires_at {
            Some(at) => println!("  Token renews:   {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            None => println!("  Token renews:   -"),
        }
        println!();
    }

    /// Stop the bot if it is running.
    pub async fn shutdown(&mut self) {
        if let Some(bot) = self.bot.as_mut() {
            bot.stop().await;
        }
    }
}

fn print_help() {
    println!();
    println!("  Available commands:");
    println!("    secret              - Set the Twitch client secret");
    println!("    twitchbot start     - Log in, join chat and keep the token fresh");
    println!("    twitchbot stop      - Leave chat and stop token renewal");
    println!("    status              - Show session and bot status");
    println!("    help                - Show this help");
    println!("    quit / exit         - Exit Cartagena");
    println!();
}

fn print_bot_usage() {
    println!("Usage: twitchbot <subcommand>");
    println!("Subcommands: start, stop");
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Run the interactive console until `quit`, EOF or Ctrl+C.
pub async fn cmd_run(settings: BotSettings) -> Result<()> {
    info!("starting Cartagena");

    let secret = secret_from_env();
    if secret.is_some() {
        info!("client secret taken from CARTAGENA_CLIENT_SECRET");
    }
    let mut console = Console::new(settings, secret);

    println!();
    println!("  Cartagena v{}", env!("CARGO_PKG_VERSION"));
    println!("  Type 'help' for commands, or 'quit' to exit.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        io::stdout().flush().ok();

        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("interrupted");
                break;
            }
        };

        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => {
                println!();
                info!("EOF received, exiting");
                break;
            }
            Err(e) => {
                eprintln!("  Error reading input: {e}");
                continue;
            }
        };

        let Some(command) = parse_command(&line) else {
            continue;
        };

        let flow = tokio::select! {
            flow = console.dispatch(command) => flow,
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("interrupted");
                Flow::Exit
            }
        };
        if flow == Flow::Exit {
            break;
        }
    }

    console.shutdown().await;
    info!("shutting down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   \t "), None);
    }

    #[test]
    fn commands_are_case_insensitive() {
        assert_eq!(parse_command("SECRET"), Some(Command::Secret));
        assert_eq!(
            parse_command("TwitchBot Start"),
            Some(Command::TwitchBot(BotAction::Start))
        );
        assert_eq!(
            parse_command("twitchbot STOP"),
            Some(Command::TwitchBot(BotAction::Stop))
        );
        assert_eq!(parse_command("Exit"), Some(Command::Quit));
        assert_eq!(parse_command("quit"), Some(Command::Quit));
    }

    #[test]
    fn twitchbot_without_subcommand_is_usage() {
        assert_eq!(
            parse_command("twitchbot"),
            Some(Command::TwitchBot(BotAction::Usage))
        );
        assert_eq!(
            parse_command("twitchbot restart"),
            Some(Command::TwitchBot(BotAction::Unknown("restart".to_string())))
        );
    }

    #[test]
    fn unknown_command_keeps_original_spelling() {
        assert_eq!(
            parse_command("  Dance now "),
            Some(Command::Unknown("Dance".to_string()))
        );
    }

    #[tokio::test]
    async fn start_without_secret_does_not_create_bot() {
        let mut console = Console::new(BotSettings::default(), None);
        let flow = console
            .dispatch(Command::TwitchBot(BotAction::Start))
            .await;
        assert_eq!(flow, Flow::Continue);
        assert!(console.bot.is_none());
    }

    #[tokio::test]
    async fn stop_without_bot_is_advisory() {
        let mut console = Console::new(BotSettings::default(), Some(ClientSecret::new("s")));
        let flow = console.dispatch(Command::TwitchBot(BotAction::Stop)).await;
        assert_eq!(flow, Flow::Continue);
        assert!(console.bot.is_none());
    }

    #[tokio::test]
    async fn quit_exits_and_others_continue() {
        let mut console = Console::new(BotSettings::default(), None);
        assert_eq!(console.dispatch(Command::Help).await, Flow::Continue);
        assert_eq!(console.dispatch(Command::Status).await, Flow::Continue);
        assert_eq!(
            console.dispatch(Command::Unknown("x".to_string())).await,
            Flow::Continue
        );
        assert_eq!(console.dispatch(Command::Quit).await, Flow::Exit);
    }
}

//! Bot settings.
//!
//! Reads the `[twitch]` section from `config/default.toml`, then applies
//! `CARTAGENA_*` environment overrides. The client secret is never read from
//! a file: it comes from the `secret` prompt or, for non-interactive use,
//! `CARTAGENA_CLIENT_SECRET`.

use std::path::Path;
use std::time::Duration;

use cartagena_auth::config::{DEFAULT_CALLBACK_TIMEOUT_SECS, DEFAULT_REDIRECT_URI};
use cartagena_auth::{AuthConfig, ClientSecret};

use crate::chat::TWITCH_IRC_URL;
use crate::helpers::env_non_empty;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// The registered Cartagena application.
const DEFAULT_CLIENT_ID: &str = "cnfaczx3u66tev6siqdv7fm33224a0";

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Everything the binary needs apart from the client secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSettings {
    pub client_id: String,
    pub redirect_uri: String,
    /// Chat channel to join; the bot's own channel when `None`.
    pub channel: Option<String>,
    pub callback_timeout_secs: u64,
    pub irc_url: String,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID.to_string(),
            redirect_uri: DEFAULT_REDIRECT_URI.to_string(),
            channel: None,
            callback_timeout_secs: DEFAULT_CALLBACK_TIMEOUT_SECS,
            irc_url: TWITCH_IRC_URL.to_string(),
        }
    }
}

impl BotSettings {
    /// Load from `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Self {
        let mut settings = load_file(path);
        settings.apply_env(env_non_empty);
        settings
    }

    /// Override fields from `CARTAGENA_CLIENT_ID`, `CARTAGENA_REDIRECT_URI`
    /// and `CARTAGENA_CHANNEL`, as resolved by `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(client_id) = lookup("CARTAGENA_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(redirect_uri) = lookup("CARTAGENA_REDIRECT_URI") {
            self.redirect_uri = redirect_uri;
        }
        if let Some(channel) = lookup("CARTAGENA_CHANNEL") {
            self.channel = Some(channel);
        }
    }

    /// The auth engine configuration for this bot.
    pub fn auth_config(&self, secret: ClientSecret) -> AuthConfig {
        let mut config = AuthConfig::new(self.client_id.clone(), secret);
        config.redirect_uri = self.redirect_uri.clone();
        config.callback_timeout = Duration::from_secs(self.callback_timeout_secs);
        config
    }
}

/// Client secret supplied through the environment, if any.
pub fn secret_from_env() -> Option<ClientSecret> {
    env_non_empty("CARTAGENA_CLIENT_SECRET").map(ClientSecret::new)
}

/// Read the `[twitch]` table. A missing file or section yields defaults.
fn load_file(path: &Path) -> BotSettings {
    let defaults = BotSettings::default();

    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return defaults,
    };

    let table: toml::Table = match content.parse() {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable config file");
            return defaults;
        }
    };

    let twitch = match table.get("twitch") {
        Some(toml::Value::Table(t)) => t,
        _ => return defaults,
    };

    let string = |key: &str| {
        twitch
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    BotSettings {
        client_id: string("client_id").unwrap_or(defaults.client_id),
        redirect_uri: string("redirect_uri").unwrap_or(defaults.redirect_uri),
        channel: string("channel"),
        callback_timeout_secs: twitch
            .get("callback_timeout_secs")
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(defaults.callback_timeout_secs),
        irc_url: string("irc_url").unwrap_or(defaults.irc_url),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Subcommand: `cartagena login` -- one-shot browser login.

use anyhow::{Context, Result};
use tracing::info;

use cartagena_auth::AuthService;

use crate::config::{BotSettings, secret_from_env};
use crate::secret::read_secret;

/// Run the authorization flow once and print who logged in.
pub async fn cmd_login(settings: BotSettings) -> Result<()> {
    let secret = match secret_from_env() {
        Some(secret) => secret,
        None => tokio::task::spawn_blocking(|| read_secret("Enter your Twitch App's CLIENT SECRET:"))
            .await
            .context("secret prompt task failed")??,
    };

    let service =
        AuthService::new(settings.auth_config(secret)).context("invalid Twitch configuration")?;

    println!("Starting full authentication flow...");
    let snapshot = service
        .run_auth_flow()
        .await
        .context("authentication failed")?;
    info!(login = snapshot.user_login().unwrap_or_default(), "login complete");

    println!();
    println!("  Logged in");
    println!("  =========");
    println!("  Display name:   {}", snapshot.display_name().unwrap_or("-"));
    println!("  Login:          {}", snapshot.user_login().unwrap_or("-"));
    println!("  User id:        {}", snapshot.user_id().unwrap_or("-"));
    if let Some(at) = snapshot.expires_at {
        println!("  Token renews:   {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    println!();

    Ok(())
}

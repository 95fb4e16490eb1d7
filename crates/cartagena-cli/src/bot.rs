//! The Twitch chat bot: authentication, chat connection and renewal.
//!
//! Starting the bot makes sure the session holds a valid token (running the
//! browser login if needed), connects to chat, and starts the token watcher.
//! Each rotation reconnects the chat through [`ChatAdapter`]. Stopping tears
//! all of that down again.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cartagena_auth::{AuthService, RegistrationHandle, SessionSnapshot, WatcherHandle};

use crate::chat::{ChatAdapter, ChatClient, ChatCredentials};

/// What is alive while the bot runs.
struct Running {
    watcher: WatcherHandle,
    registration: RegistrationHandle,
}

pub struct TwitchBot {
    service: Arc<AuthService>,
    chat: Arc<ChatClient>,
    channel: Option<String>,
    running: Option<Running>,
}

impl TwitchBot {
    pub fn new(service: Arc<AuthService>, chat: Arc<ChatClient>, channel: Option<String>) -> Self {
        Self {
            service,
            chat,
            channel,
            running: None,
        }
    }

    pub fn service(&self) -> &AuthService {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub async fn is_connected(&self) -> bool {
        self.chat.is_connected().await
    }

    /// Authenticate, connect to chat and start background renewal.
    ///
    /// Nothing is left running if any step fails.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            println!("Bot is already running.");
            return Ok(());
        }

        let adapter = Arc::new(ChatAdapter::new(
            Arc::clone(&self.chat),
            self.channel.clone(),
        ));
        let registration = self
            .service
            .on_token_rotated(adapter)
            .context("failed to register chat for token rotation")?;

        match self.bring_up().await {
            Ok(watcher) => {
                self.running = Some(Running {
                    watcher,
                    registration,
                });
                Ok(())
            }
            Err(e) => {
                self.service.remove_rotation_listener(&registration);
                Err(e)
            }
        }
    }

    async fn bring_up(&self) -> Result<WatcherHandle> {
        let snapshot = self.authenticate().await?;
        let login = snapshot.user_login().unwrap_or_default().to_string();

        // A fresh login has already connected the chat through the adapter.
        if !self.chat.is_connected().await {
            let credentials = ChatCredentials {
                login: login.clone(),
                access_token: snapshot.access_token.clone().unwrap_or_default(),
                channel: self.channel.clone().unwrap_or_else(|| login.clone()),
            };
            if let Err(e) = self.chat.connect(&credentials).await {
                warn!(error = %e, "chat connection failed; will retry on the next token rotation");
            }
        }

        let watcher = self
            .service
            .start_watcher(CancellationToken::new())
            .context("failed to start token watcher")?;

        println!(
            "Authenticated as {}",
            snapshot.display_name().unwrap_or(login.as_str())
        );
        info!(login = %login, "Twitch bot started");
        Ok(watcher)
    }

    /// Make sure the session holds a token the provider accepts and that an
    /// identity is attached to it.
    async fn authenticate(&self) -> Result<SessionSnapshot> {
        if !self.service.snapshot().has_access_token() {
            println!("Starting full authentication flow...");
        }
        let snapshot = self
            .service
            .ensure_valid()
            .await
            .context("authentication failed")?;

        if !self.service.validate().await {
            bail!("Authentication not valid");
        }
        if !snapshot.has_access_token() || snapshot.user_login().is_none_or(str::is_empty) {
            bail!("Auth did not produce valid credentials.");
        }
        Ok(snapshot)
    }

    /// Stop renewal and disconnect. Returns `false` if the bot was not running.
    pub async fn stop(&mut self) -> bool {
        let Some(running) = self.running.take() else {
            return false;
        };

        println!("Shutting down TwitchBot...");
        running.watcher.stop().await;
        self.service.remove_rotation_listener(&running.registration);
        if self.chat.disconnect().await {
            println!("Twitch client disconnected.");
        }
        println!("TwitchBot shutdown complete.");
        info!("Twitch bot stopped");
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cartagena_auth::{
        AuthConfig, BrowserLauncher, ClientSecret, Identity, SystemClock, TokenEndpoint, TokenSet,
    };
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    struct StubEndpoint;

    #[async_trait]
    impl TokenEndpoint for StubEndpoint {
        async fn exchange_code(&self, code: &str) -> cartagena_auth::Result<TokenSet> {
            assert_eq!(code, "good-code");
            Ok(TokenSet {
                access_token: "at-1".to_string(),
                refresh_token: Some("rt-1".to_string()),
                expires_in: 14_400,
            })
        }

        async fn refresh(&self, _refresh_token: &str) -> cartagena_auth::Result<TokenSet> {
            unreachable!("not used")
        }

        async fn validate(&self, access_token: &str) -> bool {
            access_token == "at-1"
        }

        async fn fetch_identity(&self, _access_token: &str) -> cartagena_auth::Result<Identity> {
            Ok(Identity {
                user_id: "1".to_string(),
                user_login: "cartagena_bot".to_string(),
                display_name: "Cartagena_Bot".to_string(),
            })
        }
    }

    /// Follows the authorize URL by hitting the redirect with a good code.
    struct RedirectingBrowser;

    impl BrowserLauncher for RedirectingBrowser {
        fn open(&self, url: &str) -> std::result::Result<(), String> {
            let url = Url::parse(url).map_err(|e| e.to_string())?;
            let param = |name: &str| {
                url.query_pairs()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default()
            };
            let redirect = Url::parse(&param("redirect_uri")).map_err(|e| e.to_string())?;
            let addr = format!(
                "{}:{}",
                redirect.host_str().unwrap_or("127.0.0.1"),
                redirect.port().unwrap_or(80)
            );
            let request = format!(
                "GET {}?code=good-code&state={} HTTP/1.1\r\nHost: localhost\r\n\r\n",
                redirect.path(),
                param("state")
            );
            tokio::spawn(async move {
                if let Ok(mut stream) = TcpStream::connect(addr).await {
                    let _ = stream.write_all(request.as_bytes()).await;
                }
            });
            Ok(())
        }
    }

    struct NoBrowser;

    impl BrowserLauncher for NoBrowser {
        fn open(&self, _url: &str) -> std::result::Result<(), String> {
            Err("no display".to_string())
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn bot(browser: Arc<dyn BrowserLauncher>, irc_url: String) -> TwitchBot {
        let mut config = AuthConfig::new("client-1", ClientSecret::new("s3cret"));
        config.redirect_uri = format!("http://127.0.0.1:{}/callback", free_port());
        config.callback_timeout = Duration::from_millis(500);
        let service = AuthService::with_parts(
            Arc::new(config),
            Arc::new(StubEndpoint),
            browser,
            Arc::new(SystemClock),
        );
        TwitchBot::new(
            Arc::new(service),
            Arc::new(ChatClient::new(irc_url)),
            None,
        )
    }

    async fn next_text(ws: &mut tokio_tungstenite::WebSocketStream<TcpStream>) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text.as_str().to_string(),
                Message::Close(_) => panic!("closed"),
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn failed_login_leaves_nothing_running() {
        let mut bot = bot(Arc::new(NoBrowser), "ws://127.0.0.1:1".to_string());

        let err = bot.start().await.unwrap_err();
        assert!(format!("{err:#}").contains("authentication failed"));
        assert!(!bot.is_running());
        assert!(!bot.service().session().notifier().is_registered());
        assert!(!bot.stop().await);
    }

    #[tokio::test]
    async fn start_logs_in_connects_chat_and_stop_tears_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let irc_url = format!("ws://{}", listener.local_addr().unwrap());
        let mut bot = bot(Arc::new(RedirectingBrowser), irc_url);

        let accept = async {
            let (tcp, _) = listener.accept().await.unwrap();
            tokio_tungstenite::accept_async(tcp).await.unwrap()
        };
        let (started, mut server) = tokio::join!(bot.start(), accept);
        started.unwrap();

        assert!(bot.is_running());
        assert!(bot.is_connected().await);
        assert_eq!(next_text(&mut server).await, "PASS oauth:at-1");
        assert_eq!(next_text(&mut server).await, "NICK cartagena_bot");
        assert_eq!(next_text(&mut server).await, "JOIN #cartagena_bot");

        // Starting again is a no-op.
        bot.start().await.unwrap();

        assert!(bot.stop().await);
        assert!(!bot.is_running());
        assert!(!bot.is_connected().await);
        assert!(!bot.service().session().notifier().is_registered());
        assert!(
            !bot.service()
                .session()
                .is_active(cartagena_auth::Activity::Watcher)
        );
    }
}

//! Twitch chat over IRC-on-WebSocket.
//!
//! A deliberately small client: it logs in with `PASS`/`NICK`, joins one
//! channel, answers server `PING`s, prints chat lines and replies to the
//! `!cartagena` command. [`ChatAdapter`] plugs it into the auth session so a
//! rotated token reconnects the chat with fresh credentials.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cartagena_auth::{RotationListener, TokenRotated};

/// Twitch's IRC-over-WebSocket endpoint.
pub const TWITCH_IRC_URL: &str = "wss://irc-ws.chat.twitch.tv:443";

const CONNECT_TIMEOUT_SECS: u64 = 15;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ---------------------------------------------------------------------------
// IRC lines
// ---------------------------------------------------------------------------

/// A chat message seen in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub channel: String,
    pub user: String,
    pub text: String,
}

/// The parts of the IRC stream the bot reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IrcEvent {
    Ping(String),
    Privmsg(ChatMessage),
    Notice(String),
    Welcome,
}

/// Parse one IRC line. Returns `None` for anything the bot ignores.
pub fn parse_line(line: &str) -> Option<IrcEvent> {
    let line = line.trim_end_matches(['\r', '\n']);

    // Skip IRCv3 tags if the server sent any.
    let line = match line.strip_prefix('@') {
        Some(tagged) => tagged.split_once(' ')?.1,
        None => line,
    };

    if let Some(payload) = line.strip_prefix("PING") {
        return Some(IrcEvent::Ping(
            payload.trim_start().trim_start_matches(':').to_string(),
        ));
    }

    let (prefix, rest) = match line.strip_prefix(':') {
        Some(prefixed) => {
            let (prefix, rest) = prefixed.split_once(' ')?;
            (Some(prefix), rest)
        }
        None => (None, line),
    };
    let (command, params) = rest.split_once(' ').unwrap_or((rest, ""));

    match command {
        "PRIVMSG" => {
            let (channel, text) = params.split_once(" :")?;
            let user = prefix?.split('!').next()?;
            Some(IrcEvent::Privmsg(ChatMessage {
                channel: channel.trim_start_matches('#').to_string(),
                user: user.to_string(),
                text: text.to_string(),
            }))
        }
        "NOTICE" => {
            let text = params.split_once(" :").map(|(_, t)| t).unwrap_or(params);
            Some(IrcEvent::Notice(text.to_string()))
        }
        "001" => Some(IrcEvent::Welcome),
        _ => None,
    }
}

/// The bot's answer to a chat message, if any.
pub fn command_reply(message: &ChatMessage) -> Option<String> {
    match message.text.trim() {
        "!cartagena" => Some(format!("Hello, {}!", message.user)),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// ChatClient
// ---------------------------------------------------------------------------

/// Login, nick and channel for one chat connection.
#[derive(Clone)]
pub struct ChatCredentials {
    pub login: String,
    pub access_token: String,
    pub channel: String,
}

impl std::fmt::Debug for ChatCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCredentials")
            .field("login", &self.login)
            .field("access_token", &"****")
            .field("channel", &self.channel)
            .finish()
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Connection {
    async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "chat connection task failed");
        }
    }
}

/// One (re)connectable chat connection.
pub struct ChatClient {
    url: String,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

impl ChatClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Connect and join, replacing any existing connection.
    pub async fn connect(&self, credentials: &ChatCredentials) -> Result<()> {
        let mut slot = self.connection.lock().await;
        if let Some(previous) = slot.take() {
            previous.shutdown().await;
        }

        let (ws, _response) = tokio::time::timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            connect_async(self.url.as_str()),
        )
        .await
        .context("timed out connecting to Twitch chat")?
        .context("failed to connect to Twitch chat")?;

        let (mut sink, stream) = ws.split();
        let login = credentials.login.to_lowercase();
        let channel = credentials.channel.to_lowercase();
        for line in [
            format!("PASS oauth:{}", credentials.access_token),
            format!("NICK {login}"),
            format!("JOIN #{channel}"),
        ] {
            sink.send(Message::Text(line.into()))
                .await
                .context("failed to log in to Twitch chat")?;
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            sink,
            stream,
            outbound_rx,
            outbound.clone(),
            cancel.clone(),
        ));

        info!(login = %login, channel = %channel, "connected to Twitch chat");
        *slot = Some(Connection {
            outbound,
            cancel,
            task,
        });
        Ok(())
    }

    /// Close the connection. Returns `false` if there was none.
    pub async fn disconnect(&self) -> bool {
        match self.connection.lock().await.take() {
            Some(connection) => {
                connection.shutdown().await;
                info!("disconnected from Twitch chat");
                true
            }
            None => false,
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }
}

async fn run_connection(
    mut sink: SplitSink<WsStream, Message>,
    mut stream: SplitStream<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    replies: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            Some(line) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(line.into())).await {
                    warn!(error = %e, "failed to send chat line");
                    break;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    for line in text.as_str().split("\r\n").filter(|l| !l.is_empty()) {
                        handle_line(line, &replies);
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("Twitch chat closed the connection");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "chat connection error");
                    break;
                }
            },
        }
    }
}

fn handle_line(line: &str, replies: &mpsc::UnboundedSender<String>) {
    match parse_line(line) {
        Some(IrcEvent::Ping(payload)) => {
            debug!("answering PING");
            let _ = replies.send(format!("PONG :{payload}"));
        }
        Some(IrcEvent::Privmsg(message)) => {
            println!("[{}] {}", message.user, message.text);
            if let Some(reply) = command_reply(&message) {
                let _ = replies.send(format!("PRIVMSG #{} :{reply}", message.channel));
            }
        }
        Some(IrcEvent::Notice(text)) => warn!(notice = %text, "Twitch chat notice"),
        Some(IrcEvent::Welcome) => info!("Twitch chat login accepted"),
        None => {}
    }
}

// ---------------------------------------------------------------------------
// ChatAdapter
// ---------------------------------------------------------------------------

/// Reconnects the chat whenever the access token rotates.
pub struct ChatAdapter {
    client: Arc<ChatClient>,
    /// Channel to join; the bot's own channel when `None`.
    channel: Option<String>,
}

impl ChatAdapter {
    pub fn new(client: Arc<ChatClient>, channel: Option<String>) -> Self {
        Self { client, channel }
    }

    pub fn credentials_for(&self, rotation: &TokenRotated) -> ChatCredentials {
        ChatCredentials {
            login: rotation.user_login.clone(),
            access_token: rotation.access_token.clone(),
            channel: self
                .channel
                .clone()
                .unwrap_or_else(|| rotation.user_login.clone()),
        }
    }
}

#[async_trait]
impl RotationListener for ChatAdapter {
    async fn on_token_rotated(&self, rotation: &TokenRotated) {
        println!("Access token updated");
        let credentials = self.credentials_for(rotation);

        if self.client.is_connected().await {
            println!("Refreshing Twitch chat credentials...");
            self.client.disconnect().await;
        }

        match self.client.connect(&credentials).await {
            Ok(()) => println!("Connected to Twitch chat as {}", rotation.user_login),
            Err(e) => warn!(error = %e, "could not connect to Twitch chat with the new token"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

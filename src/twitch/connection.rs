use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::channel_list::ChannelListSource;
use super::client::{BotCommand, BotControl, BotHandle, BotTimings};
use super::error::{Result as TwitchResult, TwitchError};
use super::irc_parser::{
    CMD_CAP, CMD_NOTICE, CMD_PONG, CMD_RECONNECT, ParsedMessage, RPL_WELCOME, RawMessage, parse,
};
use super::transport::{Connection, Transport};
use super::types::{ChatMessage, ConnectionState};
use crate::commands::CommandDispatcher;

pub const CAPABILITY_REQUEST: &str =
    "CAP REQ :twitch.tv/tags twitch.tv/commands twitch.tv/membership";

const COMMAND_BUFFER_SIZE: usize = 64;

const AUTH_FAILURE_NOTICES: [&str; 3] = [
    "Login authentication failed",
    "Improperly formatted auth",
    "Invalid NICK",
];

static IDENTITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_]{3,25}$").expect("identity pattern is valid"));
static CREDENTIAL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^oauth:[a-z0-9_]+$").expect("credential pattern is valid"));

#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn validate(&self) -> TwitchResult<()> {
        if !IDENTITY_PATTERN.is_match(&self.username) {
            return Err(TwitchError::InvalidIdentity(self.username.clone()));
        }
        if !CREDENTIAL_PATTERN.is_match(&self.token) {
            return Err(TwitchError::InvalidCredential);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_attempts: u32,
    pub connect_timeout: Duration,
    pub welcome_timeout: Duration,
    pub backoff_step: Duration,
    pub join_interval: Duration,
    pub probe_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            connect_timeout: Duration::from_secs(5),
            welcome_timeout: Duration::from_secs(10),
            backoff_step: Duration::from_secs(2),
            join_interval: Duration::from_millis(340),
            probe_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ConnectionSettings {
    /// Linear backoff: the wait after the n-th failure is n steps.
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        self.backoff_step.saturating_mul(failed_attempt)
    }
}

struct PendingProbe {
    started: Instant,
    respond_to: oneshot::Sender<Duration>,
}

/// Outstanding latency probes keyed by the token sent in `PING <token>`.
#[derive(Default)]
struct ProbeTable {
    pending: HashMap<String, PendingProbe>,
}

impl ProbeTable {
    /// Registers a probe, dropping any whose requester already gave up.
    fn insert(&mut self, token: String, respond_to: oneshot::Sender<Duration>) {
        self.pending.retain(|_, probe| !probe.respond_to.is_closed());
        self.pending.insert(
            token,
            PendingProbe {
                started: Instant::now(),
                respond_to,
            },
        );
    }

    /// Completes the probe for `token`, reporting half the round trip.
    fn resolve(&mut self, token: &str) -> Option<Duration> {
        let probe = self.pending.remove(token)?;
        let one_way = probe.started.elapsed() / 2;
        let _ = probe.respond_to.send(one_way);
        Some(one_way)
    }
}

fn pong_line(payload: Option<&str>) -> String {
    match payload {
        Some(payload) => format!("PONG {}", payload),
        None => "PONG".to_string(),
    }
}

fn is_auth_failure(raw: &RawMessage<'_>) -> bool {
    raw.command == CMD_NOTICE
        && raw
            .trailing()
            .is_some_and(|text| AUTH_FAILURE_NOTICES.iter().any(|n| text.starts_with(n)))
}

/// Owns the chat connection: connects with retry, runs the receive loop,
/// and hands chat messages to command handlers.
pub struct TwitchBot {
    runtime: BotRuntime,
    command_rx: mpsc::Receiver<BotCommand>,
}

struct BotRuntime {
    credentials: Credentials,
    settings: ConnectionSettings,
    transport: Arc<dyn Transport>,
    channel_list: Arc<dyn ChannelListSource>,
    shutdown: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    handle: BotHandle,
    handler_failures: Arc<AtomicU64>,
}

type HandlerSet = JoinSet<TwitchResult<()>>;

impl TwitchBot {
    pub fn new(
        credentials: Credentials,
        settings: ConnectionSettings,
        transport: Arc<dyn Transport>,
        channel_list: Arc<dyn ChannelListSource>,
        shutdown: CancellationToken,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let handler_failures = Arc::new(AtomicU64::new(0));
        let handle = BotHandle::new(
            command_tx,
            &credentials.username,
            Arc::clone(&channel_list),
            BotTimings {
                join_interval: settings.join_interval,
                probe_timeout: settings.probe_timeout,
            },
            shutdown.clone(),
            state_rx,
            Arc::clone(&handler_failures),
        );

        Self {
            runtime: BotRuntime {
                credentials,
                settings,
                transport,
                channel_list,
                shutdown,
                state_tx,
                handle,
                handler_failures,
            },
            command_rx,
        }
    }

    pub fn handle(&self) -> BotHandle {
        self.runtime.handle.clone()
    }

    /// Runs until shutdown (`Ok`) or a fatal error.
    pub async fn run(self, dispatcher: CommandDispatcher) -> TwitchResult<()> {
        let Self {
            runtime,
            mut command_rx,
        } = self;
        runtime.run(Arc::new(dispatcher), &mut command_rx).await
    }
}

impl BotRuntime {
    fn set_state(&self, new_state: ConnectionState) {
        if *self.state_tx.borrow() == new_state {
            return;
        }
        tracing::info!(state = ?new_state, "Connection state changed");
        self.state_tx.send_replace(new_state);
    }

    async fn run(
        &self,
        dispatcher: Arc<CommandDispatcher>,
        command_rx: &mut mpsc::Receiver<BotCommand>,
    ) -> TwitchResult<()> {
        if let Err(e) = self.credentials.validate() {
            tracing::error!(error = %e, "Refusing to connect");
            self.set_state(ConnectionState::Failed {
                reason: e.to_string(),
            });
            return Err(e);
        }

        let mut handlers = HandlerSet::new();
        let mut startup = true;
        let outcome = loop {
            let conn = match self.connect_with_retry().await {
                Ok(conn) => conn,
                Err(e) => break Err(e),
            };
            match self
                .run_session(conn, startup, &dispatcher, command_rx, &mut handlers)
                .await
            {
                Ok(()) => break Ok(()),
                Err(e) if e.is_transient() => {
                    tracing::warn!(error = %e, "Connection lost, reconnecting");
                    self.set_state(ConnectionState::Disconnected);
                    startup = false;
                }
                Err(e) => break Err(e),
            }
        };

        command_rx.close();
        self.drain_handlers(&mut handlers).await;

        match outcome {
            Ok(()) | Err(TwitchError::Shutdown) => {
                self.set_state(ConnectionState::Disconnected);
                tracing::info!("Bot stopped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Bot failed");
                self.set_state(ConnectionState::Failed {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self) -> TwitchResult<Connection> {
        let max_attempts = self.settings.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                let failed_attempt = attempt - 1;
                let retry_in = self.settings.backoff_delay(failed_attempt);
                self.set_state(ConnectionState::Backoff {
                    failed_attempt,
                    retry_in,
                });
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(TwitchError::Shutdown),
                    _ = tokio::time::sleep(retry_in) => {}
                }
            }

            self.set_state(ConnectionState::Connecting { attempt });
            match self.try_connect(attempt).await {
                Ok(conn) => {
                    self.set_state(ConnectionState::Ready);
                    return Ok(conn);
                }
                Err(TwitchError::Shutdown) => return Err(TwitchError::Shutdown),
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Connection attempt failed"
                    );
                }
            }
        }

        Err(TwitchError::ConnectRetriesExhausted {
            attempts: max_attempts,
        })
    }

    async fn try_connect(&self, attempt: u32) -> TwitchResult<Connection> {
        let connect_timeout = self.settings.connect_timeout;
        let mut conn = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TwitchError::Shutdown),
            result = tokio::time::timeout(connect_timeout, self.transport.connect()) => {
                result.map_err(|_| TwitchError::ConnectTimeout(connect_timeout))??
            }
        };

        self.set_state(ConnectionState::Authenticating { attempt });
        let welcome_timeout = self.settings.welcome_timeout;
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => Err(TwitchError::Shutdown),
            result = tokio::time::timeout(welcome_timeout, self.authenticate(&mut conn)) => {
                result.unwrap_or(Err(TwitchError::WelcomeTimeout(welcome_timeout)))
            }
        };

        match outcome {
            Ok(()) => Ok(conn),
            Err(e) => {
                conn.disconnect().await;
                Err(e)
            }
        }
    }

    /// Sends credentials and waits for the welcome numeric, answering PINGs
    /// that arrive first.
    async fn authenticate(&self, conn: &mut Connection) -> TwitchResult<()> {
        conn.send_line(&format!("PASS {}", self.credentials.token))
            .await?;
        conn.send_line(&format!("NICK {}", self.credentials.username))
            .await?;

        while let Some(line) = conn.next_line().await {
            let line = line?;
            match parse(&line) {
                ParsedMessage::Ping(ping) => conn.send_line(&pong_line(ping.payload)).await?,
                ParsedMessage::Raw(raw) if raw.command == RPL_WELCOME => {
                    tracing::info!(user.name = %self.credentials.username, "Authenticated");
                    return Ok(());
                }
                ParsedMessage::Raw(raw) if is_auth_failure(&raw) => {
                    return Err(TwitchError::AuthenticationRejected(
                        raw.trailing().unwrap_or_default().to_string(),
                    ));
                }
                _ => {}
            }
        }
        Err(TwitchError::ConnectionClosed)
    }

    /// Runs one connected session. Channel lookup and paced joins run on a
    /// session-scoped task set, aborted when the session ends. A lookup failure
    /// is fatal only on the `startup` session.
    async fn run_session(
        &self,
        mut conn: Connection,
        startup: bool,
        dispatcher: &Arc<CommandDispatcher>,
        command_rx: &mut mpsc::Receiver<BotCommand>,
        handlers: &mut HandlerSet,
    ) -> TwitchResult<()> {
        let session_id = Uuid::new_v4();
        tracing::info!(session.id = %session_id, peer = %conn.peer(), startup, "Session started");

        conn.send_line(CAPABILITY_REQUEST).await?;

        let mut session_tasks = JoinSet::new();
        let join_handle = self.handle.clone();
        session_tasks.spawn(async move { join_handle.join_channels().await });

        let mut probes = ProbeTable::default();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!(session.id = %session_id, "Shutdown requested, closing connection");
                    conn.disconnect().await;
                    return Ok(());
                }
                line = conn.next_line() => {
                    let Some(line) = line else {
                        tracing::warn!(session.id = %session_id, "Server closed the connection");
                        return Err(TwitchError::ConnectionClosed);
                    };
                    let line = line?;
                    self.handle_line(&line, &mut conn, &mut probes, dispatcher, handlers)
                        .await?;
                }
                Some(command) = command_rx.recv() => match command {
                    BotCommand::SendLine { line } => conn.send_line(&line).await?,
                    BotCommand::Probe { token, respond_to } => {
                        probes.insert(token.clone(), respond_to);
                        conn.send_line(&format!("PING {}", token)).await?;
                    }
                },
                Some(result) = handlers.join_next(), if !handlers.is_empty() => {
                    self.record_handler_outcome(result);
                }
                Some(result) = session_tasks.join_next(), if !session_tasks.is_empty() => {
                    match result {
                        Ok(Ok(joined)) => {
                            tracing::info!(session.id = %session_id, joined, "Joined channels");
                        }
                        Ok(Err(TwitchError::Shutdown)) => {}
                        Ok(Err(e)) if startup => {
                            conn.disconnect().await;
                            return Err(e);
                        }
                        Ok(Err(e)) => tracing::error!(
                            session.id = %session_id,
                            error = %e,
                            "Channel join failed, staying connected until a rejoin"
                        ),
                        Err(e) => tracing::error!(session.id = %session_id, error = %e, "Join task failed"),
                    }
                }
            }
        }
    }

    async fn handle_line(
        &self,
        line: &str,
        conn: &mut Connection,
        probes: &mut ProbeTable,
        dispatcher: &Arc<CommandDispatcher>,
        handlers: &mut HandlerSet,
    ) -> TwitchResult<()> {
        match parse(line) {
            ParsedMessage::Ping(ping) => conn.send_line(&pong_line(ping.payload)).await?,
            ParsedMessage::PrivateMessage(message) => {
                tracing::debug!(
                    channel.name = %message.channel,
                    sender = %message.sender,
                    message.id = message.tags.get("id").unwrap_or_default(),
                    "{}",
                    message.body
                );
                self.spawn_handler(message.to_chat_message(), dispatcher, handlers);
            }
            ParsedMessage::Raw(raw) => self.handle_raw(&raw, probes)?,
        }
        Ok(())
    }

    fn handle_raw(&self, raw: &RawMessage<'_>, probes: &mut ProbeTable) -> TwitchResult<()> {
        match raw.command {
            CMD_PONG => {
                if let Some(token) = raw.trailing() {
                    match probes.resolve(token) {
                        Some(latency) => tracing::debug!(?latency, "Latency probe answered"),
                        None => tracing::trace!(token, "PONG without a pending probe"),
                    }
                }
            }
            CMD_CAP => match raw.parameters.split_whitespace().nth(1) {
                Some("ACK") => tracing::info!(
                    capabilities = raw.trailing().unwrap_or_default(),
                    "Capabilities acknowledged"
                ),
                Some("NAK") => tracing::warn!(
                    capabilities = raw.trailing().unwrap_or_default(),
                    "Capabilities rejected"
                ),
                _ => tracing::debug!(parameters = raw.parameters, "CAP reply"),
            },
            CMD_NOTICE => tracing::info!(
                notice = raw.trailing().unwrap_or_default(),
                "Server notice"
            ),
            CMD_RECONNECT => return Err(TwitchError::ReconnectRequested),
            _ => tracing::trace!(command = raw.command, "Unhandled line: {}", raw.line),
        }
        Ok(())
    }

    fn spawn_handler(
        &self,
        message: ChatMessage,
        dispatcher: &Arc<CommandDispatcher>,
        handlers: &mut HandlerSet,
    ) {
        let dispatcher = Arc::clone(dispatcher);
        let handle = self.handle.clone();
        handlers.spawn(async move {
            if let Some(reply) = dispatcher.handle(&message).await {
                handle.send_line(reply).await?;
            }
            Ok(())
        });
    }

    fn record_handler_outcome(&self, result: Result<TwitchResult<()>, JoinError>) {
        match result {
            Ok(Ok(())) | Ok(Err(TwitchError::Shutdown)) => {}
            Ok(Err(e)) => {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Message handler failed");
            }
            Err(e) if e.is_panic() => {
                self.handler_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Message handler panicked");
            }
            Err(e) => tracing::debug!(error = %e, "Message handler cancelled"),
        }
    }

    async fn drain_handlers(&self, handlers: &mut HandlerSet) {
        if handlers.is_empty() {
            return;
        }
        let grace = self.settings.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(result) = handlers.join_next().await {
                self.record_handler_outcome(result);
            }
        })
        .await;

        if drained.is_err() {
            tracing::warn!(
                remaining = handlers.len(),
                ?grace,
                "Handlers still running after grace period, aborting"
            );
            handlers.shutdown().await;
        }
    }
}

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::channel_list::ChannelListSource;
use super::error::{Result as TwitchResult, TwitchError};
use super::types::ConnectionState;

/// Requests from handler tasks to the task that owns the connection.
#[derive(Debug)]
pub enum BotCommand {
    SendLine {
        line: String,
    },
    Probe {
        token: String,
        respond_to: oneshot::Sender<Duration>,
    },
}

/// What chat command handlers may ask of the running bot.
#[async_trait]
pub trait BotControl: Send + Sync {
    async fn send_line(&self, line: String) -> TwitchResult<()>;

    /// Round-trip latency to the server, or `None` if no reply arrived in time.
    async fn measure_latency(&self) -> Option<Duration>;

    /// Re-reads the channel list and joins every listed channel, paced.
    async fn join_channels(&self) -> TwitchResult<usize>;
}

#[derive(Debug, Clone)]
pub struct BotTimings {
    pub join_interval: Duration,
    pub probe_timeout: Duration,
}

#[derive(Clone)]
pub struct BotHandle {
    sender: mpsc::Sender<BotCommand>,
    identity: Arc<str>,
    channel_list: Arc<dyn ChannelListSource>,
    timings: BotTimings,
    shutdown: CancellationToken,
    state_rx: watch::Receiver<ConnectionState>,
    handler_failures: Arc<AtomicU64>,
}

impl BotHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<BotCommand>,
        identity: &str,
        channel_list: Arc<dyn ChannelListSource>,
        timings: BotTimings,
        shutdown: CancellationToken,
        state_rx: watch::Receiver<ConnectionState>,
        handler_failures: Arc<AtomicU64>,
    ) -> Self {
        Self {
            sender,
            identity: Arc::from(identity),
            channel_list,
            timings,
            shutdown,
            state_rx,
            handler_failures,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    pub async fn join(&self, channel: &str) -> TwitchResult<()> {
        self.send_line(format!("JOIN #{}", channel)).await
    }

    /// Joins each channel in order, waiting the join interval before each one.
    pub async fn join_sequence(&self, channels: Vec<String>) -> TwitchResult<usize> {
        let mut joined = 0;
        for channel in channels {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(TwitchError::Shutdown),
                _ = tokio::time::sleep(self.timings.join_interval) => {}
            }
            self.join(&channel).await?;
            tracing::debug!(channel.name = %channel, "Sent JOIN");
            joined += 1;
        }
        Ok(joined)
    }
}

#[async_trait]
impl BotControl for BotHandle {
    async fn send_line(&self, line: String) -> TwitchResult<()> {
        self.sender
            .send(BotCommand::SendLine { line })
            .await
            .map_err(|e| TwitchError::ActorComm(format!("Failed to send SendLine: {}", e)))
    }

    async fn measure_latency(&self) -> Option<Duration> {
        let token = rand::random::<u64>().to_string();
        let (respond_to_tx, respond_to_rx) = oneshot::channel();
        if let Err(e) = self
            .sender
            .send(BotCommand::Probe {
                token,
                respond_to: respond_to_tx,
            })
            .await
        {
            tracing::warn!(error = %e, "Failed to queue latency probe");
            return None;
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => None,
            reply = tokio::time::timeout(self.timings.probe_timeout, respond_to_rx) => match reply {
                Ok(Ok(elapsed)) => Some(elapsed),
                Ok(Err(_)) => {
                    tracing::debug!("Latency probe dropped before a reply arrived");
                    None
                }
                Err(_) => {
                    tracing::debug!(timeout = ?self.timings.probe_timeout, "Latency probe timed out");
                    None
                }
            },
        }
    }

    async fn join_channels(&self) -> TwitchResult<usize> {
        let channels = self.channel_list.lookup(&self.identity).await?;
        self.join_sequence(channels).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twitch::channel_list::StaticChannelList;

    fn handle_with(
        channels: Vec<String>,
        probe_timeout: Duration,
    ) -> (BotHandle, mpsc::Receiver<BotCommand>, CancellationToken) {
        let (tx, rx) = mpsc::channel(16);
        let (_state_tx, state_rx) = watch::channel(ConnectionState::Ready);
        let shutdown = CancellationToken::new();
        let handle = BotHandle::new(
            tx,
            "sedbot",
            Arc::new(StaticChannelList::new(channels)),
            BotTimings {
                join_interval: Duration::from_millis(340),
                probe_timeout,
            },
            shutdown.clone(),
            state_rx,
            Arc::new(AtomicU64::new(0)),
        );
        (handle, rx, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_channels_is_paced() {
        let (handle, mut rx, _shutdown) = handle_with(vec!["a".into(), "b".into()], Duration::from_secs(5));
        let start = tokio::time::Instant::now();

        let joined = handle.join_channels().await.unwrap();
        assert_eq!(joined, 2);
        assert!(start.elapsed() >= Duration::from_millis(680));

        let mut lines = Vec::new();
        while let Ok(BotCommand::SendLine { line }) = rx.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines, vec!["JOIN #a".to_string(), "JOIN #b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_resolves_with_elapsed() {
        let (handle, mut rx, _shutdown) = handle_with(Vec::new(), Duration::from_secs(5));
        let responder = tokio::spawn(async move {
            match rx.recv().await {
                Some(BotCommand::Probe { token, respond_to }) => {
                    assert!(token.parse::<u64>().is_ok(), "token should be numeric");
                    let _ = respond_to.send(Duration::from_millis(42));
                }
                other => panic!("expected probe, got {:?}", other),
            }
        });

        assert_eq!(handle.measure_latency().await, Some(Duration::from_millis(42)));
        responder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_times_out() {
        let (handle, mut rx, _shutdown) = handle_with(Vec::new(), Duration::from_secs(5));
        // Keep the probe alive but never answer it.
        let holder = tokio::spawn(async move {
            let held = rx.recv().await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(held);
        });

        let start = tokio::time::Instant::now();
        assert_eq!(handle.measure_latency().await, None);
        assert!(start.elapsed() >= Duration::from_secs(5));
        holder.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_join_sequence() {
        let (handle, _rx, shutdown) = handle_with(Vec::new(), Duration::from_secs(5));
        shutdown.cancel();
        let result = handle.join_sequence(vec!["a".into()]).await;
        assert!(matches!(result, Err(TwitchError::Shutdown)));
    }
}

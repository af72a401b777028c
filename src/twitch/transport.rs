use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{self, RootCertStore, pki_types::ServerName};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead, LinesCodec, LinesCodecError};

use super::error::{Result as TwitchResult, TwitchError};

/// Longest line accepted from the server before it is discarded.
const MAX_LINE_LENGTH: usize = 8192;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line codec that drops over-long lines and keeps decoding whatever is
/// already buffered behind them.
#[derive(Debug)]
pub struct ChatLineCodec {
    inner: LinesCodec,
}

impl ChatLineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(max_length),
        }
    }
}

impl Decoder for ChatLineCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("Discarding line longer than {} bytes", self.inner.max_length());
                }
                other => return other,
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode_eof(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    tracing::warn!("Discarding line longer than {} bytes", self.inner.max_length());
                }
                other => return other,
            }
        }
    }
}

/// Opens byte-stream connections to the chat server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> TwitchResult<Connection>;
}

/// One open connection, framed into CRLF-terminated lines.
pub struct Connection {
    peer: String,
    lines: FramedRead<BoxedReader, ChatLineCodec>,
    writer: BoxedWriter,
}

impl Connection {
    pub fn new<R, W>(peer: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            peer: peer.into(),
            lines: FramedRead::new(
                Box::new(reader) as BoxedReader,
                ChatLineCodec::new(MAX_LINE_LENGTH),
            ),
            writer: Box::new(writer),
        }
    }

    pub fn from_stream<S>(peer: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(peer, reader, writer)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send_line(&mut self, line: &str) -> TwitchResult<()> {
        if line.starts_with("PASS ") {
            tracing::trace!(peer = %self.peer, "-> PASS ***");
        } else {
            tracing::trace!(peer = %self.peer, "-> {}", line);
        }
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next non-empty line with the terminator stripped. `None` once the peer
    /// closes the stream.
    pub async fn next_line(&mut self) -> Option<TwitchResult<String>> {
        loop {
            match self.lines.next().await? {
                Ok(line) if line.is_empty() => continue,
                Ok(line) => {
                    tracing::trace!(peer = %self.peer, "<- {}", line);
                    return Some(Ok(line));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    pub async fn disconnect(mut self) {
        if let Err(e) = self.writer.shutdown().await {
            tracing::debug!(peer = %self.peer, error = %e, "Error while closing connection");
        }
    }
}

/// TCP transport, optionally wrapped in TLS.
pub struct TcpTransport {
    address: String,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl TcpTransport {
    pub fn new(address: impl Into<String>, use_tls: bool) -> TwitchResult<Self> {
        let tls = if use_tls { Some(tls_client_config()?) } else { None };
        Ok(Self {
            address: address.into(),
            tls,
        })
    }

    fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map_or(self.address.as_str(), |(host, _)| host)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self) -> TwitchResult<Connection> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;

        let Some(config) = &self.tls else {
            tracing::debug!(address = %self.address, "TCP connection established");
            return Ok(Connection::from_stream(self.address.clone(), stream));
        };

        let server_name = ServerName::try_from(self.host().to_string())
            .map_err(|e| TwitchError::Tls(format!("invalid server name {}: {}", self.host(), e)))?;
        let tls_stream = TlsConnector::from(Arc::clone(config))
            .connect(server_name, stream)
            .await?;
        tracing::debug!(address = %self.address, "TLS connection established");
        Ok(Connection::from_stream(self.address.clone(), tls_stream))
    }
}

fn tls_client_config() -> TwitchResult<Arc<rustls::ClientConfig>> {
    let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| TwitchError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_lines_are_framed_and_terminated() {
        let (client, server) = tokio::io::duplex(1024);
        let mut conn = Connection::from_stream("duplex", client);
        let (server_read, mut server_write) = tokio::io::split(server);

        server_write
            .write_all(b"PING :tmi.twitch.tv\r\n\r\n:tmi.twitch.tv 001 bot :Welcome\r\n")
            .await
            .unwrap();
        assert_eq!(conn.next_line().await.unwrap().unwrap(), "PING :tmi.twitch.tv");
        assert_eq!(
            conn.next_line().await.unwrap().unwrap(),
            ":tmi.twitch.tv 001 bot :Welcome"
        );

        conn.send_line("PONG tmi.twitch.tv").await.unwrap();
        let mut server_lines = BufReader::new(server_read).lines();
        assert_eq!(
            server_lines.next_line().await.unwrap().as_deref(),
            Some("PONG tmi.twitch.tv")
        );
    }

    #[tokio::test]
    async fn test_closed_stream_ends_lines() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream("duplex", client);
        drop(server);
        assert!(conn.next_line().await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_line_is_skipped() {
        let (client, server) = tokio::io::duplex(MAX_LINE_LENGTH * 2);
        let mut conn = Connection::from_stream("duplex", client);
        let (_server_read, mut server_write) = tokio::io::split(server);

        let mut payload = "x".repeat(MAX_LINE_LENGTH + 10);
        payload.push_str("\r\nPING :after\r\n");
        server_write.write_all(payload.as_bytes()).await.unwrap();

        let line = tokio::time::timeout(Duration::from_secs(2), conn.next_line())
            .await
            .expect("buffered line should be decoded without more input");
        assert_eq!(line.unwrap().unwrap(), "PING :after");
    }

    #[test]
    fn test_codec_decodes_lines_buffered_behind_oversized_one() {
        let mut codec = ChatLineCodec::new(16);
        let mut buf = BytesMut::from(&b"0123456789abcdefghij\r\nPING :a\r\nPING :b\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :a"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :b"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_codec_discards_oversized_tail_at_eof() {
        let mut codec = ChatLineCodec::new(8);
        let mut buf = BytesMut::from(&b"ok\r\n0123456789abcdef"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap().as_deref(), Some("ok"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_host_strips_port() {
        let transport = TcpTransport::new("irc.chat.twitch.tv:6697", false).unwrap();
        assert_eq!(transport.host(), "irc.chat.twitch.tv");
    }
}

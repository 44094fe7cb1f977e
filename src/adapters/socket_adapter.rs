//! Raw TCP stream connector.
//!
//! Commands are terminated and encoded per the instrument settings; a query
//! reads until the reply ends with the read terminator.

use super::framing::{encode_command, read_until_terminator, strip_reply};
use super::{Encoding, Transport, TransportKind, TransportSettings};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// TCP socket connector.
pub struct SocketAdapter {
    stream: Option<TcpStream>,
    peer: String,
    write_terminator: String,
    read_terminator: String,
    encoding: Encoding,
    timeout: Duration,
    delay: Option<Duration>,
}

impl SocketAdapter {
    /// Unconnected adapter.
    pub fn new() -> Self {
        Self {
            stream: None,
            peer: String::new(),
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            encoding: Encoding::default(),
            timeout: super::DEFAULT_TIMEOUT,
            delay: None,
        }
    }

    /// Connect to an explicit host and port, taking framing from `settings`.
    pub(crate) async fn connect(
        &mut self,
        host: &str,
        port: u16,
        settings: &TransportSettings,
    ) -> Result<()> {
        self.write_terminator = settings.write_terminator().to_string();
        self.read_terminator = settings.read_terminator().to_string();
        self.encoding = settings.encoding;
        self.timeout = settings.io_timeout();
        self.delay = settings.delay;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| anyhow!("Connecting to {}:{} timed out after {:?}", host, port, self.timeout))?
            .with_context(|| format!("Failed to connect to {}:{}", host, port))?;
        stream.set_nodelay(true)?;

        self.peer = format!("{}:{}", host, port);
        self.stream = Some(stream);
        debug!("Socket connected to {}", self.peer);
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| anyhow!("Socket is not connected"))
    }
}

impl Default for SocketAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SocketAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&mut self, settings: &TransportSettings) -> Result<()> {
        let (host, port) = settings.socket_target()?;
        self.connect(&host, port, settings).await
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        let bytes = encode_command(command, &self.write_terminator, self.encoding)?;
        let timeout = self.timeout;
        let stream = self.stream()?;
        tokio::time::timeout(timeout, stream.write_all(&bytes))
            .await
            .map_err(|_| anyhow!("Write timed out after {:?}", timeout))?
            .context("Failed to write to socket")?;
        Ok(())
    }

    async fn query(&mut self, command: &str, delay: Option<Duration>) -> Result<Option<String>> {
        self.write(command).await?;
        if let Some(pause) = delay.or(self.delay) {
            tokio::time::sleep(pause).await;
        }
        let terminator = self.read_terminator.clone();
        let timeout = self.timeout;
        let encoding = self.encoding;
        let stream = self.stream()?;
        let raw = read_until_terminator(stream, terminator.as_bytes(), timeout).await?;
        let reply = strip_reply(&encoding.decode(&raw), &terminator);
        debug!("{} < '{}'", self.peer, reply);
        Ok(Some(reply))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Socket to {} closed", self.peer);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Echo server answering `V?` with `5.0` and recording everything else.
    async fn spawn_instrument() -> (u16, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line == "V?" {
                    write.write_all(b"5.0\n").await.unwrap();
                }
                tx.send(line).unwrap();
            }
        });
        (port, rx)
    }

    #[tokio::test]
    async fn test_write_and_query() {
        let (port, mut seen) = spawn_instrument().await;
        let mut adapter = SocketAdapter::new();
        let settings = TransportSettings::new(format!("127.0.0.1:{}", port));
        adapter.open(&settings).await.unwrap();
        assert!(adapter.is_open());

        adapter.write("V 5").await.unwrap();
        assert_eq!(seen.recv().await.unwrap(), "V 5");

        let reply = adapter.query("V?", None).await.unwrap();
        assert_eq!(reply.as_deref(), Some("5.0"));

        adapter.close().await.unwrap();
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_open_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut adapter = SocketAdapter::new();
        let settings = TransportSettings::new(format!("127.0.0.1:{}", port));
        assert!(adapter.open(&settings).await.is_err());
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_write_without_connection_fails() {
        let mut adapter = SocketAdapter::new();
        assert!(adapter.write("X").await.is_err());
    }
}

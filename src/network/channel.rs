//! Newline framed messaging over TCP.
//!
//! Two patterns cover the remote proxy:
//!
//! - **Handshake** (request/reply): a [`HandshakeServer`] accepts any number of
//!   connections and hands each received line to its owner together with a
//!   reply slot; a [`HandshakeClient`] sends one line and waits, bounded by a
//!   timeout, for the answer.
//! - **Data** (publish/subscribe): a [`Publisher`] fans every published line
//!   out to all connected subscribers; a [`Subscriber`] keeps only lines whose
//!   first token equals its topic and buffers them for non-blocking drains.
//!
//! Data delivery is best-effort: a line published while nobody is connected,
//! or arriving at a full subscriber buffer, is dropped.

use crate::error::{HwError, HwResult};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, warn};

/// Lines a subscriber buffers before dropping new arrivals.
pub const SUBSCRIBER_CAPACITY: usize = 1024;
const PUBLISHER_CAPACITY: usize = 1024;
const HANDSHAKE_QUEUE: usize = 32;

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(line.len() + 1);
    frame.extend_from_slice(line.trim_end_matches(['\r', '\n']).as_bytes());
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Reads one line; `Ok(None)` on a clean close.
async fn read_line(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    match reader.read_line(&mut line).await? {
        0 => Ok(None),
        _ => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
    }
}

/// Resolve `host:port` with a bounded connect.
async fn connect(address: &str, limit: Duration) -> Result<TcpStream> {
    let stream = timeout(limit, TcpStream::connect(address))
        .await
        .with_context(|| format!("connecting to {} timed out after {:?}", address, limit))?
        .with_context(|| format!("failed to connect to {}", address))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// First whitespace separated token of a line.
pub fn topic_of(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

// ---- handshake ----

/// A line received by a [`HandshakeServer`], waiting for its reply.
#[derive(Debug)]
pub struct HandshakeRequest {
    /// The request line without its newline.
    pub message: String,
    /// Sender of the request.
    pub peer: SocketAddr,
    reply: oneshot::Sender<String>,
}

impl HandshakeRequest {
    /// Send the reply. The requester may already be gone.
    pub fn respond(self, reply: impl Into<String>) {
        if self.reply.send(reply.into()).is_err() {
            debug!("Handshake peer {} left before the reply", self.peer);
        }
    }
}

/// Request/reply endpoint.
pub struct HandshakeServer {
    local_addr: SocketAddr,
    requests: mpsc::Receiver<HandshakeRequest>,
    accept_task: JoinHandle<()>,
}

impl HandshakeServer {
    /// Bind and start accepting connections.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind handshake endpoint {}", address))?;
        let local_addr = listener.local_addr()?;
        let (tx, requests) = mpsc::channel(HANDSHAKE_QUEUE);
        debug!("Handshake endpoint listening on {}", local_addr);

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::serve_peer(stream, peer, tx).await {
                                warn!("Handshake peer {} error: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Handshake accept error: {}", e),
                }
            }
        });

        Ok(Self {
            local_addr,
            requests,
            accept_task,
        })
    }

    async fn serve_peer(
        stream: TcpStream,
        peer: SocketAddr,
        requests: mpsc::Sender<HandshakeRequest>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        debug!("Handshake peer connected: {}", peer);

        while let Some(message) = read_line(&mut reader).await? {
            let (reply, answer) = oneshot::channel();
            let request = HandshakeRequest {
                message,
                peer,
                reply,
            };
            if requests.send(request).await.is_err() {
                debug!("Handshake endpoint closed, dropping peer {}", peer);
                break;
            }
            match answer.await {
                Ok(line) => write_line(&mut write, &line).await?,
                Err(_) => warn!("Handshake request from {} was dropped unanswered", peer),
            }
        }
        debug!("Handshake peer disconnected: {}", peer);
        Ok(())
    }

    /// Bound address; resolves a requested port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next request; `None` once the endpoint is gone.
    pub async fn recv(&mut self) -> Option<HandshakeRequest> {
        self.requests.recv().await
    }

    /// Next request if one is already waiting.
    pub fn try_recv(&mut self) -> Option<HandshakeRequest> {
        self.requests.try_recv().ok()
    }
}

impl Drop for HandshakeServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Request/reply client with a bounded wait.
pub struct HandshakeClient {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    local_addr: SocketAddr,
    timeout: Duration,
}

impl HandshakeClient {
    /// Connect to a handshake endpoint. `timeout` bounds the connect and every
    /// later request.
    pub async fn connect(address: &str, timeout: Duration) -> HwResult<Self> {
        let stream = connect(address, timeout)
            .await
            .map_err(|e| HwError::Transport(format!("{:#}", e)))?;
        let local_addr = stream.local_addr()?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            address: address.to_string(),
            reader: BufReader::new(read),
            writer,
            local_addr,
            timeout,
        })
    }

    /// Local end of the connection, as seen by the server.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handshake address this client connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one line and wait for the reply.
    pub async fn request(&mut self, message: &str) -> HwResult<String> {
        let limit = self.timeout;
        let (writer, reader) = (&mut self.writer, &mut self.reader);
        let exchange = async {
            write_line(writer, message).await?;
            read_line(reader).await
        };
        match timeout(limit, exchange).await {
            Err(_) => Err(HwError::Timeout(limit)),
            Ok(Err(e)) => Err(HwError::Io(e)),
            Ok(Ok(None)) => Err(HwError::Transport(format!(
                "handshake endpoint {} closed the connection",
                self.address
            ))),
            Ok(Ok(Some(reply))) => Ok(reply),
        }
    }
}

// ---- data ----

/// Fan-out endpoint of the data channel.
pub struct Publisher {
    local_addr: SocketAddr,
    lines: broadcast::Sender<String>,
    accept_task: JoinHandle<()>,
}

impl Publisher {
    /// Bind the publish endpoint. Port 0 picks a free port.
    ///
    /// Every accepted subscriber first receives an empty line, which marks the
    /// moment it starts receiving publications.
    pub async fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .with_context(|| format!("failed to bind publish endpoint {}", address))?;
        let local_addr = listener.local_addr()?;
        let (lines, _) = broadcast::channel::<String>(PUBLISHER_CAPACITY);
        debug!("Publishing on {}", local_addr);

        let fan_out = lines.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let feed = fan_out.subscribe();
                        tokio::spawn(Self::feed_subscriber(stream, peer, feed));
                    }
                    Err(e) => error!("Publisher accept error: {}", e),
                }
            }
        });

        Ok(Self {
            local_addr,
            lines,
            accept_task,
        })
    }

    async fn feed_subscriber(
        stream: TcpStream,
        peer: SocketAddr,
        mut feed: broadcast::Receiver<String>,
    ) {
        let _ = stream.set_nodelay(true);
        let (_read, mut write) = stream.into_split();
        debug!("Subscriber connected: {}", peer);
        if write_line(&mut write, "").await.is_err() {
            return;
        }
        loop {
            match feed.recv().await {
                Ok(line) => {
                    if let Err(e) = write_line(&mut write, &line).await {
                        debug!("Subscriber {} gone: {}", peer, e);
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber {} lagging, {} messages dropped", peer, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Bound address; resolves a requested port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.lines.receiver_count()
    }

    /// Publish one line; returns how many subscribers it was queued for.
    pub fn publish(&self, line: impl Into<String>) -> usize {
        let line = line.into();
        match self.lines.send(line) {
            Ok(n) => n,
            Err(broadcast::error::SendError(line)) => {
                debug!("No subscribers on {}, dropped '{}'", self.local_addr, line);
                0
            }
        }
    }

    /// Wait until at least `count` subscribers are connected.
    pub async fn wait_for_subscribers(&self, count: usize, limit: Duration) -> HwResult<()> {
        let wait = async {
            while self.subscriber_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(limit, wait).await.map_err(|_| HwError::Timeout(limit))
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Result of one bounded drain.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Lines in arrival order.
    pub messages: Vec<String>,
    /// No more messages were waiting when the drain stopped.
    pub exhausted: bool,
}

/// Topic-filtered receiving end of the data channel.
pub struct Subscriber {
    address: String,
    topic: String,
    lines: mpsc::Receiver<String>,
    closed: Arc<AtomicBool>,
    read_task: JoinHandle<()>,
}

impl Subscriber {
    /// Connect to a publisher and keep lines whose first token is `topic`.
    ///
    /// An empty topic keeps everything. Returns once the publisher has
    /// registered the subscription.
    pub async fn connect(address: &str, topic: &str, limit: Duration) -> HwResult<Self> {
        let stream = connect(address, limit)
            .await
            .map_err(|e| HwError::Transport(format!("{:#}", e)))?;
        let (read, _write) = stream.into_split();
        let mut reader = BufReader::new(read);

        match timeout(limit, read_line(&mut reader)).await {
            Err(_) => return Err(HwError::Timeout(limit)),
            Ok(Err(e)) => return Err(HwError::Io(e)),
            Ok(Ok(None)) => {
                return Err(HwError::Transport(format!(
                    "publisher {} closed during subscribe",
                    address
                )))
            }
            Ok(Ok(Some(_))) => {}
        }

        let (tx, lines) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let read_task = tokio::spawn(Self::pump(
            reader,
            topic.to_string(),
            address.to_string(),
            tx,
            closed.clone(),
        ));
        debug!("Subscribed to {} with topic '{}'", address, topic);

        Ok(Self {
            address: address.to_string(),
            topic: topic.to_string(),
            lines,
            closed,
            read_task,
        })
    }

    async fn pump(
        mut reader: BufReader<OwnedReadHalf>,
        topic: String,
        address: String,
        tx: mpsc::Sender<String>,
        closed: Arc<AtomicBool>,
    ) {
        loop {
            match read_line(&mut reader).await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() || (!topic.is_empty() && topic_of(&line) != topic) {
                        continue;
                    }
                    if let Err(mpsc::error::TrySendError::Full(line)) = tx.try_send(line) {
                        warn!("Subscriber buffer for {} full, dropped '{}'", address, line);
                    }
                }
                Ok(None) => {
                    debug!("Publisher {} closed", address);
                    break;
                }
                Err(e) => {
                    warn!("Reading from publisher {} failed: {}", address, e);
                    break;
                }
            }
        }
        closed.store(true, Ordering::SeqCst);
    }

    /// Publisher address this subscriber is connected to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// First-token filter applied to incoming lines.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The publisher went away. Buffered lines can still be drained.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take up to `max` buffered lines without waiting.
    pub fn drain(&mut self, max: usize) -> Batch {
        let mut batch = Batch::default();
        while batch.messages.len() < max {
            match self.lines.try_recv() {
                Ok(line) => batch.messages.push(line),
                Err(_) => {
                    batch.exhausted = true;
                    return batch;
                }
            }
        }
        batch.exhausted = self.lines.is_empty();
        batch
    }

    /// Wait up to `limit` for the next line.
    pub async fn recv_timeout(&mut self, limit: Duration) -> Option<String> {
        timeout(limit, self.lines.recv()).await.ok().flatten()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.read_task.abort();
    }
}

//! Exposer: serves a local instrument to one remote consumer at a time.

use super::channel::{HandshakeRequest, HandshakeServer, Publisher, Subscriber};
use super::protocol::{
    error_reply, unknown_command_reply, ControlMessage, DataRequest, Reading, RequestAction,
    Welcome, ACK,
};
use super::session::RemoteSession;
use super::Join;
use crate::config::RemoteConfig;
use crate::error::{HwError, HwResult};
use crate::instrument::{Instrument, ONLINE};
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument as _};

/// How a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Stopped,
    PeerLost,
    Shutdown,
}

fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Republishes one instrument.
pub struct Exposer {
    instrument: Instrument,
    handshake: HandshakeServer,
    publisher: Publisher,
    config: RemoteConfig,
}

impl Exposer {
    /// Bind the handshake endpoint (fixed port) and the publish endpoint
    /// (dynamic when `publish_port` is 0).
    pub async fn bind(instrument: Instrument, config: &RemoteConfig) -> HwResult<Self> {
        let handshake = HandshakeServer::bind(&config.handshake_address())
            .await
            .map_err(|e| HwError::Transport(format!("{:#}", e)))?;
        let publisher = Publisher::bind(&config.publish_address())
            .await
            .map_err(|e| HwError::Transport(format!("{:#}", e)))?;
        info!(
            "Exposing {} (handshake {}, publish {})",
            instrument.name(),
            handshake.local_addr(),
            publisher.local_addr()
        );
        Ok(Self {
            instrument,
            handshake,
            publisher,
            config: config.clone(),
        })
    }

    /// Name of the served instrument.
    pub fn name(&self) -> &str {
        self.instrument.name()
    }

    /// Bound handshake endpoint.
    pub fn handshake_addr(&self) -> SocketAddr {
        self.handshake.local_addr()
    }

    /// Bound publish endpoint.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// The served instrument.
    pub fn instrument(&self) -> &Instrument {
        &self.instrument
    }

    fn welcome(&self) -> Welcome {
        let address = self.publisher.local_addr();
        Welcome {
            name: self.instrument.name().to_string(),
            host: address.ip().to_string(),
            port: address.port(),
        }
    }

    /// Serve sessions until `shutdown` turns true or its sender is dropped.
    ///
    /// Returns the instrument, closed, so the caller can reuse it.
    pub async fn serve(mut self, mut shutdown: watch::Receiver<bool>) -> Instrument {
        self.instrument.try_connect().await;

        while !shutdown_requested(&shutdown) {
            let request = tokio::select! {
                request = self.handshake.recv() => request,
                _ = wait_for_shutdown(&mut shutdown) => None,
            };
            let Some(request) = request else { break };

            match ControlMessage::parse(&request.message) {
                ControlMessage::App { publish_address } => {
                    let Some(session) = self.open_session(&publish_address, request).await else {
                        continue;
                    };
                    if self.run_session(session, &shutdown).await == SessionEnd::Shutdown {
                        break;
                    }
                }
                _ => {
                    warn!(
                        "({}) unexpected handshake message '{}' from {}",
                        self.name(),
                        request.message,
                        request.peer
                    );
                    let reply = unknown_command_reply(&request.message);
                    request.respond(reply);
                }
            }
        }

        info!("{}: exposer shutting down", self.name());
        self.instrument.close().await;
        self.instrument
    }

    /// Subscribe to the consumer and answer its `APP`.
    async fn open_session(
        &mut self,
        address: &str,
        request: HandshakeRequest,
    ) -> Option<RemoteSession> {
        let limit = self.config.handshake_timeout();
        match Subscriber::connect(address, self.instrument.name(), limit).await {
            Ok(subscriber) => {
                let session = RemoteSession::new(address, subscriber);
                info!(
                    session = %session.id,
                    "{}: session opened for {} (publishing to {})",
                    self.name(),
                    request.peer,
                    address
                );
                request.respond(self.welcome().to_string());
                Some(session)
            }
            Err(e) => {
                error!(
                    "({}) could not subscribe to consumer at {}: {}",
                    self.name(),
                    address,
                    e
                );
                request.respond(error_reply(format_args!("cannot subscribe to {}: {}", address, e)));
                None
            }
        }
    }

    async fn run_session(
        &mut self,
        mut session: RemoteSession,
        shutdown: &watch::Receiver<bool>,
    ) -> SessionEnd {
        let reconnect_every = self.config.reconnect_every.max(1);
        let mut iteration: u64 = 0;

        let end = loop {
            if iteration % reconnect_every == 0 {
                self.instrument.try_connect().await;
                self.announce_online();
            }
            iteration = iteration.wrapping_add(1);

            session.ingest(self.config.max_batch);
            for request in session.take_pending() {
                self.dispatch(request).await;
            }

            if let Some(control) = self.handshake.try_recv() {
                self.handle_control(&mut session, control);
            }

            if !session.is_running() {
                break SessionEnd::Stopped;
            }
            if shutdown_requested(shutdown) {
                break SessionEnd::Shutdown;
            }
            if session.peer_closed() && !session.has_backlog() {
                warn!(
                    session = %session.id,
                    "{}: consumer at {} went away",
                    self.name(),
                    session.peer
                );
                break SessionEnd::PeerLost;
            }
            if session.has_backlog() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.loop_interval()).await;
            }
        };

        info!(session = %session.id, "{}: session ended ({:?})", self.name(), end);
        end
    }

    /// Publish `<name> ONLINE <True|False>`.
    fn announce_online(&self) {
        let reading = Reading::new(self.name(), ONLINE, self.instrument.is_online());
        self.publisher.publish(reading.to_string());
    }

    async fn dispatch(&mut self, request: DataRequest) {
        debug!("{}: dispatching '{}'", self.name(), request);
        match request.action {
            RequestAction::Set { parameter, value } => {
                self.instrument.set_value(&parameter, value).await;
            }
            RequestAction::Get { parameter } => match self.instrument.get_value(&parameter).await {
                Some(value) => {
                    let reading = Reading::new(self.name(), &parameter, value);
                    self.publisher.publish(reading.to_string());
                }
                None => debug!("({}) no value for '{}', nothing published", self.name(), parameter),
            },
            RequestAction::Command { name } => self.instrument.command(&name).await,
        }
    }

    fn handle_control(&mut self, session: &mut RemoteSession, control: HandshakeRequest) {
        match ControlMessage::parse(&control.message) {
            ControlMessage::Stop => {
                info!(session = %session.id, "{}: stop requested", self.name());
                session.stop();
                control.respond(ACK);
            }
            ControlMessage::ListParameters => {
                let reply = match self.instrument.list_parameters().to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        error!("({}) cannot encode parameter list: {}", self.name(), e);
                        error_reply(e)
                    }
                };
                control.respond(reply);
            }
            ControlMessage::App { .. } => {
                warn!(
                    session = %session.id,
                    "{}: APP from {} while a session is active",
                    self.name(),
                    control.peer
                );
                control.respond(error_reply("session already active"));
            }
            ControlMessage::Unknown(text) => {
                warn!("({}) unexpected handshake message '{}'", self.name(), text);
                control.respond(unknown_command_reply(&text));
            }
        }
    }

    /// Run [`serve`](Self::serve) on the tokio runtime, inside an `exposer`
    /// span that is a child of the caller's span.
    pub fn spawn(self) -> ExposerHandle {
        let (shutdown, rx) = watch::channel(false);
        let name = self.name().to_string();
        let handshake_addr = self.handshake_addr();
        let publish_addr = self.publish_addr();
        let span = info_span!("exposer", instrument = %name);
        let task = tokio::spawn(self.serve(rx).instrument(span));
        ExposerHandle {
            name,
            handshake_addr,
            publish_addr,
            shutdown,
            task: Some(task),
        }
    }
}

/// A spawned [`Exposer`]. Dropping the handle also stops it.
pub struct ExposerHandle {
    name: String,
    handshake_addr: SocketAddr,
    publish_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<Instrument>>,
}

impl ExposerHandle {
    /// Name of the served instrument.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where consumers send `APP`.
    pub fn handshake_addr(&self) -> SocketAddr {
        self.handshake_addr
    }

    /// Where readings are published.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publish_addr
    }

    /// Stop the exposer and take the instrument back.
    pub async fn shutdown(mut self) -> HwResult<Instrument> {
        self.stop()
            .await?
            .ok_or_else(|| HwError::Transport(format!("{}: exposer already joined", self.name)))
    }

    async fn stop(&mut self) -> HwResult<Option<Instrument>> {
        // The task may already have ended; then nobody is listening.
        let _ = self.shutdown.send(true);
        match self.task.take() {
            Some(task) => task
                .await
                .map(Some)
                .map_err(|e| HwError::Transport(format!("{}: exposer task failed: {}", self.name, e))),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Join for ExposerHandle {
    async fn join(&mut self) -> HwResult<()> {
        self.stop().await.map(|_| ())
    }
}

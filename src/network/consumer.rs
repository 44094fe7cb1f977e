//! Consumer: local stand-in for an instrument served by an [`Exposer`](super::Exposer).

use super::channel::{HandshakeClient, Publisher, Subscriber};
use super::protocol::{check_reply, ControlMessage, DataRequest, Reading, Welcome, ACK};
use super::Join;
use crate::config::RemoteConfig;
use crate::core::ParameterValue;
use crate::error::{HwError, HwResult};
use crate::instrument::{ParameterList, ONLINE};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Host part of a `host:port` address.
fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

/// Where to reach the exposer's publisher. An unspecified host in the welcome
/// means "the machine you are talking to".
fn publish_target(welcome: &Welcome, handshake_address: &str) -> String {
    let host = match welcome.host.parse::<IpAddr>() {
        Ok(ip) if ip.is_unspecified() => host_of(handshake_address).to_string(),
        _ => welcome.host.clone(),
    };
    match host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, welcome.port).to_string(),
        Err(_) => format!("{}:{}", host, welcome.port),
    }
}

/// Remote proxy for one instrument.
///
/// # Example
///
/// ```no_run
/// use rust_hwctl::config::RemoteConfig;
/// use rust_hwctl::network::{Consumer, Join, DEFAULT_PRIORITY};
///
/// # async fn demo() -> rust_hwctl::error::HwResult<()> {
/// let mut psu = Consumer::connect("10.0.0.2:5555", "PSU", &RemoteConfig::default()).await?;
/// println!("{:?}", psu.list_parameters().await?);
/// psu.set_value("VOLT", 5.0, DEFAULT_PRIORITY);
/// psu.join().await?;
/// # Ok(())
/// # }
/// ```
pub struct Consumer {
    name: String,
    remote_name: String,
    handshake: HandshakeClient,
    publisher: Publisher,
    subscriber: Subscriber,
    stopped: bool,
}

impl Consumer {
    /// Open a session with the exposer whose handshake endpoint is `address`.
    ///
    /// A remote name other than `name` is logged as an error; the session is
    /// still opened with the remote's actual name.
    pub async fn connect(address: &str, name: &str, config: &RemoteConfig) -> HwResult<Self> {
        let limit = config.handshake_timeout();
        let mut handshake = HandshakeClient::connect(address, limit).await?;

        // Bind on the interface the exposer already reaches us through.
        let local = SocketAddr::new(handshake.local_addr().ip(), 0);
        let publisher = Publisher::bind(&local.to_string())
            .await
            .map_err(|e| HwError::Transport(format!("{:#}", e)))?;

        let app = ControlMessage::App {
            publish_address: publisher.local_addr().to_string(),
        };
        let welcome = Welcome::parse(&handshake.request(&app.to_string()).await?)?;
        if welcome.name != name {
            error!(
                "Expected instrument '{}' at {}, but it exposes '{}'",
                name, address, welcome.name
            );
        }

        let target = publish_target(&welcome, address);
        let subscriber = Subscriber::connect(&target, &welcome.name, limit).await?;
        publisher.wait_for_subscribers(1, limit).await?;
        info!(
            "Connected to remote instrument {} at {} (data from {})",
            welcome.name, address, target
        );

        Ok(Self {
            name: name.to_string(),
            remote_name: welcome.name,
            handshake,
            publisher,
            subscriber,
            stopped: false,
        })
    }

    /// The name this consumer was asked to connect to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name the exposer reported; used as data channel topic.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Local publisher the exposer subscribes to.
    pub fn publish_addr(&self) -> SocketAddr {
        self.publisher.local_addr()
    }

    /// Fetch the remote capability surface.
    pub async fn list_parameters(&mut self) -> HwResult<ParameterList> {
        let reply = self
            .handshake
            .request(&ControlMessage::ListParameters.to_string())
            .await?;
        ParameterList::from_json(check_reply(&reply)?)
    }

    fn send(&self, request: DataRequest) {
        let line = request.to_string();
        if self.publisher.publish(&*line) == 0 {
            warn!("({}) no exposer subscribed, dropped '{}'", self.remote_name, line);
        } else {
            debug!("({}) sent '{}'", self.remote_name, line);
        }
    }

    /// Ask the exposer to set a parameter.
    pub fn set_value(&self, parameter: &str, value: impl Into<ParameterValue>, priority: u8) {
        self.send(DataRequest::set(&self.remote_name, priority, parameter, value));
    }

    /// Ask the exposer to read a parameter and publish the result.
    pub fn request_value(&self, parameter: &str, priority: u8) {
        self.send(DataRequest::get(&self.remote_name, priority, parameter));
    }

    /// Ask the exposer to run a command.
    pub fn command(&self, name: &str, priority: u8) {
        self.send(DataRequest::command(&self.remote_name, priority, name));
    }

    fn parse_reading(&self, line: &str) -> Option<Reading> {
        Reading::parse(line)
            .inspect_err(|e| warn!("({}) ignoring publication: {}", self.remote_name, e))
            .ok()
    }

    /// Readings that already arrived, up to `max`, without waiting.
    pub fn poll_readings(&mut self, max: usize) -> Vec<Reading> {
        let batch = self.subscriber.drain(max);
        batch
            .messages
            .iter()
            .filter_map(|line| self.parse_reading(line))
            .collect()
    }

    /// Wait up to `limit` for the next reading.
    pub async fn next_reading(&mut self, limit: Duration) -> Option<Reading> {
        let deadline = Instant::now() + limit;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let line = self.subscriber.recv_timeout(left).await?;
            if let Some(reading) = self.parse_reading(&line) {
                return Some(reading);
            }
        }
    }

    /// Request a parameter and wait up to `limit` for its reading.
    ///
    /// Readings of other parameters that arrive meanwhile are discarded.
    pub async fn get_value(
        &mut self,
        parameter: &str,
        priority: u8,
        limit: Duration,
    ) -> Option<ParameterValue> {
        self.request_value(parameter, priority);
        let deadline = Instant::now() + limit;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let reading = self.next_reading(left).await?;
            if reading.parameter == parameter {
                return Some(reading.value);
            }
            debug!("({}) skipping reading of {}", self.remote_name, reading.parameter);
        }
    }

    /// Set a parameter and wait up to `limit` until the exposer has applied it.
    ///
    /// Requests on one priority level are served in arrival order, so a read
    /// queued behind the set comes back only after the set was dispatched.
    /// Readable parameters are read back and the value returned; for set-only
    /// parameters an `ONLINE` reading serves as the marker and `None` is
    /// returned.
    pub async fn set_confirmed(
        &mut self,
        parameter: &str,
        value: impl Into<ParameterValue>,
        priority: u8,
        limit: Duration,
    ) -> HwResult<Option<ParameterValue>> {
        let readable = self
            .list_parameters()
            .await?
            .reads
            .iter()
            .any(|read| read == parameter && read != ONLINE);
        let stale = self.poll_readings(usize::MAX).len();
        if stale > 0 {
            debug!("({}) discarded {} stale readings", self.remote_name, stale);
        }

        self.set_value(parameter, value, priority);
        let marker = if readable { parameter } else { ONLINE };
        let echo = self
            .get_value(marker, priority, limit)
            .await
            .ok_or(HwError::Timeout(limit))?;
        Ok(readable.then_some(echo))
    }

    /// End the session: send `STOP` and wait for the acknowledgement.
    pub async fn stop(&mut self) -> HwResult<()> {
        if self.stopped {
            return Ok(());
        }
        let reply = self.handshake.request(&ControlMessage::Stop.to_string()).await?;
        if check_reply(&reply)? != ACK {
            return Err(HwError::Protocol(format!(
                "expected {} to STOP, got '{}'",
                ACK, reply
            )));
        }
        self.stopped = true;
        info!("Session with {} stopped", self.remote_name);
        Ok(())
    }
}

#[async_trait]
impl Join for Consumer {
    async fn join(&mut self) -> HwResult<()> {
        self.stop().await
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if !self.stopped {
            debug!("({}) dropped without STOP", self.remote_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn welcome(host: &str) -> Welcome {
        Welcome {
            name: "PSU".into(),
            host: host.into(),
            port: 4100,
        }
    }

    #[test]
    fn test_publish_target() {
        assert_eq!(
            publish_target(&welcome("10.0.0.2"), "10.0.0.9:5555"),
            "10.0.0.2:4100"
        );
        assert_eq!(
            publish_target(&welcome("0.0.0.0"), "10.0.0.9:5555"),
            "10.0.0.9:4100"
        );
        assert_eq!(
            publish_target(&welcome("0.0.0.0"), "lab-pc:5555"),
            "lab-pc:4100"
        );
        assert_eq!(
            publish_target(&welcome("::"), "[::1]:5555"),
            "[::1]:4100"
        );
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.9:5555"), "10.0.0.9");
        assert_eq!(host_of("[::1]:5555"), "::1");
        assert_eq!(host_of("lab-pc"), "lab-pc");
    }
}

//! Point-to-point connector for VISA-style resource addresses.
//!
//! Two resource classes are served natively:
//! - `ASRL<port>::INSTR` serial lines, through the `serialport` crate
//!   (feature `instrument_serial`)
//! - `TCPIP<n>::<host>::<port>::SOCKET` raw sockets
//!
//! Any other VISA interface (GPIB, USB, VXI, PXI, LXI `INSTR`) would need a
//! VISA library binding and fails at `open()`.

use super::framing::{encode_command, strip_reply};
use super::{Encoding, SocketAdapter, Transport, TransportKind, TransportSettings};
use crate::error::HwError;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use anyhow::Context;
#[cfg(feature = "instrument_serial")]
use serialport::SerialPort;
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// A parsed VISA resource string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisaResource {
    /// Serial line with the OS port name
    Serial(String),
    /// Raw TCP socket
    Socket {
        /// Host name or IP
        host: String,
        /// TCP port
        port: u16,
    },
    /// Interface needing a VISA library
    Unsupported(String),
}

/// Parse a VISA resource string.
pub fn parse_resource(address: &str) -> Result<VisaResource> {
    let parts: Vec<&str> = address.trim().split("::").collect();
    let interface = parts.first().copied().unwrap_or_default();
    let upper = interface.to_ascii_uppercase();

    if let Some(rest) = upper.strip_prefix("ASRL") {
        // Keep the original spelling of device paths
        let path = &interface[interface.len() - rest.len()..];
        if path.is_empty() {
            return Err(anyhow!("Serial resource '{}' has no port", address));
        }
        return Ok(VisaResource::Serial(serial_port_name(path)));
    }

    let is_socket = parts
        .last()
        .map(|p| p.eq_ignore_ascii_case("SOCKET"))
        .unwrap_or(false);
    if upper.starts_with("TCPIP") && is_socket {
        if parts.len() != 4 {
            return Err(anyhow!("Malformed socket resource '{}'", address));
        }
        let port = parts[2]
            .parse::<u16>()
            .map_err(|e| anyhow!("Invalid port in '{}': {}", address, e))?;
        return Ok(VisaResource::Socket {
            host: parts[1].to_string(),
            port,
        });
    }

    Ok(VisaResource::Unsupported(address.to_string()))
}

/// Map a VISA serial board number to an OS port name; paths pass through.
fn serial_port_name(path: &str) -> String {
    match path.parse::<u32>() {
        Ok(n) if cfg!(windows) => format!("COM{}", n),
        Ok(n) => format!("/dev/ttyS{}", n),
        Err(_) => path.to_string(),
    }
}

enum Link {
    #[cfg(feature = "instrument_serial")]
    Serial(Arc<Mutex<Box<dyn SerialPort>>>),
    Socket(SocketAdapter),
}

/// Point-to-point connector.
pub struct PointToPointAdapter {
    link: Option<Link>,
    resource: String,
    write_terminator: String,
    read_terminator: String,
    encoding: Encoding,
    timeout: Duration,
    delay: Option<Duration>,
}

impl PointToPointAdapter {
    /// Unconnected adapter.
    pub fn new() -> Self {
        Self {
            link: None,
            resource: String::new(),
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            encoding: Encoding::default(),
            timeout: super::DEFAULT_TIMEOUT,
            delay: None,
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn open_serial(&self, port_name: &str, settings: &TransportSettings) -> Result<Link> {
        use super::Parity;

        let serial = &settings.serial;
        let baud = serial.baud_rate.unwrap_or(9600);
        let mut builder = serialport::new(port_name, baud).timeout(Duration::from_millis(100));
        if let Some(bits) = serial.data_bits {
            builder = builder.data_bits(match bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                8 => serialport::DataBits::Eight,
                other => return Err(anyhow!("Unsupported data bits: {}", other)),
            });
        }
        if let Some(bits) = serial.stop_bits {
            builder = builder.stop_bits(match bits {
                1 => serialport::StopBits::One,
                2 => serialport::StopBits::Two,
                other => return Err(anyhow!("Unsupported stop bits: {}", other)),
            });
        }
        if let Some(parity) = serial.parity {
            builder = builder.parity(match parity {
                Parity::None => serialport::Parity::None,
                Parity::Odd => serialport::Parity::Odd,
                Parity::Even => serialport::Parity::Even,
            });
        }
        let port = builder
            .open()
            .with_context(|| format!("Failed to open serial port '{}' at {} baud", port_name, baud))?;
        debug!("Serial port '{}' opened at {} baud", port_name, baud);
        Ok(Link::Serial(Arc::new(Mutex::new(port))))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open_serial(&self, _port_name: &str, _settings: &TransportSettings) -> Result<Link> {
        Err(HwError::FeatureNotEnabled("instrument_serial".into()).into())
    }

    #[cfg(feature = "instrument_serial")]
    async fn serial_exchange(
        port: Arc<Mutex<Box<dyn SerialPort>>>,
        bytes: Vec<u8>,
        delay: Option<Duration>,
        reply_terminator: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        // Serial I/O is blocking; keep it off the runtime threads.
        tokio::task::spawn_blocking(move || {
            use std::io::Write;

            let mut guard = port.blocking_lock();
            guard
                .write_all(&bytes)
                .context("Failed to write to serial port")?;
            guard.flush().context("Failed to flush serial port")?;

            let Some(terminator) = reply_terminator else {
                return Ok(None);
            };
            if let Some(pause) = delay {
                std::thread::sleep(pause);
            }
            let raw = super::framing::read_until_terminator_blocking(
                &mut **guard,
                &terminator,
                timeout,
            )?;
            Ok(Some(raw))
        })
        .await
        .context("Serial I/O task panicked")?
    }
}

impl Default for PointToPointAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for PointToPointAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::PointToPoint
    }

    async fn open(&mut self, settings: &TransportSettings) -> Result<()> {
        self.resource = settings.address.clone();
        self.write_terminator = settings.write_terminator().to_string();
        self.read_terminator = settings.read_terminator().to_string();
        self.encoding = settings.encoding;
        self.timeout = settings.io_timeout();
        self.delay = settings.delay;

        let link = match parse_resource(&settings.address)? {
            VisaResource::Serial(port_name) => self.open_serial(&port_name, settings)?,
            VisaResource::Socket { host, port } => {
                let mut socket = SocketAdapter::new();
                socket.connect(&host, port, settings).await?;
                Link::Socket(socket)
            }
            VisaResource::Unsupported(resource) => {
                return Err(HwError::Transport(format!(
                    "no driver for VISA resource '{}' (supported: ASRL serial ports, TCPIP SOCKET)",
                    resource
                ))
                .into());
            }
        };
        self.link = Some(link);
        debug!("Opened point-to-point connection to '{}'", self.resource);
        Ok(())
    }

    async fn write(&mut self, command: &str) -> Result<()> {
        match self.link.as_mut() {
            Some(Link::Socket(socket)) => socket.write(command).await,
            #[cfg(feature = "instrument_serial")]
            Some(Link::Serial(port)) => {
                let bytes = encode_command(command, &self.write_terminator, self.encoding)?;
                Self::serial_exchange(port.clone(), bytes, None, None, self.timeout).await?;
                Ok(())
            }
            None => Err(anyhow!("'{}' is not open", self.resource)),
        }
    }

    async fn query(&mut self, command: &str, delay: Option<Duration>) -> Result<Option<String>> {
        let delay = delay.or(self.delay);
        match self.link.as_mut() {
            Some(Link::Socket(socket)) => socket.query(command, delay).await,
            #[cfg(feature = "instrument_serial")]
            Some(Link::Serial(port)) => {
                let bytes = encode_command(command, &self.write_terminator, self.encoding)?;
                let terminator = self.read_terminator.as_bytes().to_vec();
                let raw = Self::serial_exchange(
                    port.clone(),
                    bytes,
                    delay,
                    Some(terminator),
                    self.timeout,
                )
                .await?
                .unwrap_or_default();
                let reply = strip_reply(&self.encoding.decode(&raw), &self.read_terminator);
                debug!("{} < '{}'", self.resource, reply);
                Ok(Some(reply))
            }
            None => Err(anyhow!("'{}' is not open", self.resource)),
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.link.take() {
            Some(Link::Socket(mut socket)) => socket.close().await?,
            #[cfg(feature = "instrument_serial")]
            Some(Link::Serial(_)) => debug!("Serial port '{}' closed", self.resource),
            None => {}
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.link.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_path() {
        assert_eq!(
            parse_resource("ASRL/dev/ttyUSB0::INSTR").unwrap(),
            VisaResource::Serial("/dev/ttyUSB0".into())
        );
    }

    #[test]
    fn test_parse_serial_board_number() {
        let expected = if cfg!(windows) { "COM3" } else { "/dev/ttyS3" };
        assert_eq!(
            parse_resource("ASRL3::INSTR").unwrap(),
            VisaResource::Serial(expected.into())
        );
    }

    #[test]
    fn test_parse_socket_resource() {
        assert_eq!(
            parse_resource("TCPIP0::10.1.2.3::5025::SOCKET").unwrap(),
            VisaResource::Socket {
                host: "10.1.2.3".into(),
                port: 5025
            }
        );
        assert!(parse_resource("TCPIP0::10.1.2.3::notaport::SOCKET").is_err());
    }

    #[test]
    fn test_parse_unsupported() {
        assert!(matches!(
            parse_resource("GPIB0::12::INSTR").unwrap(),
            VisaResource::Unsupported(_)
        ));
        assert!(matches!(
            parse_resource("TCPIP0::10.1.2.3::inst0::INSTR").unwrap(),
            VisaResource::Unsupported(_)
        ));
    }

    #[tokio::test]
    async fn test_open_gpib_is_unsupported() {
        let mut adapter = PointToPointAdapter::new();
        let err = adapter
            .open(&TransportSettings::new("GPIB0::12::INSTR"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no driver for VISA resource 'GPIB0::12::INSTR'"));
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_socket_resource_round_trip() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*IDN?\r\n");
            stream.write_all(b"ACME,PSU-1,0,1.0\r\n").await.unwrap();
        });

        let mut settings = TransportSettings::new(format!("TCPIP0::127.0.0.1::{}::SOCKET", port));
        settings.termination = "\r\n".into();
        let mut adapter = PointToPointAdapter::new();
        adapter.open(&settings).await.unwrap();
        let reply = adapter.query("*IDN?", None).await.unwrap();
        assert_eq!(reply.as_deref(), Some("ACME,PSU-1,0,1.0"));
    }
}

// src/adapters/mod.rs

//! Transport connectors.
//!
//! A [`Transport`] turns an instrument's abstract write/query into bytes on a wire.
//! Which connector an instrument uses follows from its address (see
//! [`TransportKind::from_address`]) unless the configuration names one explicitly.
//!
//! Connectors report failures as `anyhow` errors; they never touch the
//! instrument's connection state. The instrument boundary logs the error and
//! takes the instrument offline.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod framing;

pub mod serial_adapter;
pub use serial_adapter::PointToPointAdapter;

pub mod socket_adapter;
pub use socket_adapter::SocketAdapter;

pub mod modbus_adapter;
pub use modbus_adapter::ModbusAdapter;

pub mod mock_adapter;
pub use mock_adapter::MockTransport;

/// Address prefixes handled by the point-to-point connector.
pub const VISA_PREFIXES: [&str; 7] = ["ASRL", "GPIB", "PXI", "VISA", "TCPIP", "USB", "VXI"];

/// Timeout used when the instrument configures none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Wire framing family of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Serial-like resource addressed VISA style (`ASRL…`, `GPIB…`, `TCPIP…::SOCKET`)
    #[serde(alias = "serial", alias = "visa")]
    PointToPoint,
    /// Raw TCP stream, `host[:port]`
    #[serde(alias = "tcp")]
    Socket,
    /// Modbus/TCP register protocol
    Modbus,
    /// No connection (dummy-only instruments)
    None,
}

impl TransportKind {
    /// Infer the kind from an address.
    ///
    /// Modbus is never inferred; it must be requested explicitly.
    pub fn from_address(address: &str) -> Self {
        let address = address.trim();
        if address.is_empty() || address.eq_ignore_ascii_case("none") {
            return TransportKind::None;
        }
        let upper = address.to_ascii_uppercase();
        if VISA_PREFIXES.iter().any(|p| upper.starts_with(p)) {
            TransportKind::PointToPoint
        } else {
            TransportKind::Socket
        }
    }

    /// Lower-case name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::PointToPoint => "point_to_point",
            TransportKind::Socket => "socket",
            TransportKind::Modbus => "modbus",
            TransportKind::None => "none",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "point_to_point" | "serial" | "visa" => Ok(TransportKind::PointToPoint),
            "socket" | "tcp" => Ok(TransportKind::Socket),
            "modbus" => Ok(TransportKind::Modbus),
            "none" => Ok(TransportKind::None),
            other => Err(anyhow!("Unknown transport kind '{}'", other)),
        }
    }
}

/// Character encoding for text transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    /// 7-bit ASCII; other characters are rejected when encoding
    #[serde(rename = "ascii")]
    Ascii,
    /// ISO-8859-1, one byte per character
    #[serde(rename = "latin-1", alias = "latin1")]
    Latin1,
}

impl Encoding {
    /// Encode `text` to bytes.
    pub fn encode(&self, text: &str) -> Result<Vec<u8>> {
        match self {
            Encoding::Utf8 => Ok(text.as_bytes().to_vec()),
            Encoding::Ascii => {
                if text.is_ascii() {
                    Ok(text.as_bytes().to_vec())
                } else {
                    Err(anyhow!("'{}' is not ASCII", text))
                }
            }
            Encoding::Latin1 => text
                .chars()
                .map(|c| {
                    u8::try_from(u32::from(c))
                        .map_err(|_| anyhow!("'{}' cannot be encoded as latin-1", c))
                })
                .collect(),
        }
    }

    /// Decode bytes received from the wire. Invalid sequences are replaced.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 | Encoding::Ascii => String::from_utf8_lossy(bytes).into_owned(),
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
        }
    }
}

impl FromStr for Encoding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Ok(Encoding::Utf8),
            "ascii" => Ok(Encoding::Ascii),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(Encoding::Latin1),
            other => Err(anyhow!("Unsupported encoding '{}'", other)),
        }
    }
}

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial line settings. Unset fields keep the port defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate (default 9600)
    pub baud_rate: Option<u32>,
    /// Data bits, 5 to 8
    pub data_bits: Option<u8>,
    /// Stop bits, 1 or 2
    pub stop_bits: Option<u8>,
    /// Parity
    pub parity: Option<Parity>,
}

/// Connection parameters handed to [`Transport::open`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportSettings {
    /// Transport-specific address
    pub address: String,
    /// Selected connector
    pub kind: TransportKind,
    /// Generic terminator, used where no read/write override is set
    pub termination: String,
    /// Terminator expected at the end of replies
    pub read_termination: Option<String>,
    /// Terminator appended to outgoing commands
    pub write_termination: Option<String>,
    /// Text encoding
    pub encoding: Encoding,
    /// I/O timeout
    pub timeout: Option<Duration>,
    /// Pause after a successful open, before the connection is verified
    pub startup_delay: Duration,
    /// Pause between the write and the read of a query
    pub delay: Option<Duration>,
    /// Port used when a socket address carries none
    pub default_port: Option<u16>,
    /// Serial line settings
    pub serial: SerialSettings,
}

impl TransportSettings {
    /// Settings for `address` with the connector inferred from it.
    pub fn new(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            kind: TransportKind::from_address(&address),
            address,
            termination: "\n".to_string(),
            read_termination: None,
            write_termination: None,
            encoding: Encoding::default(),
            timeout: None,
            startup_delay: Duration::ZERO,
            delay: None,
            default_port: None,
            serial: SerialSettings::default(),
        }
    }

    /// Terminator expected at the end of a reply.
    pub fn read_terminator(&self) -> &str {
        self.read_termination.as_deref().unwrap_or(&self.termination)
    }

    /// Terminator appended to a command.
    pub fn write_terminator(&self) -> &str {
        self.write_termination
            .as_deref()
            .unwrap_or(&self.termination)
    }

    /// I/O timeout, falling back to [`DEFAULT_TIMEOUT`].
    pub fn io_timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_TIMEOUT)
    }

    /// Split a socket address into host and port.
    ///
    /// Splits on the last `:`; without one the default port is used.
    pub fn socket_target(&self) -> Result<(String, u16)> {
        let address = self.address.trim();
        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .with_context(|| format!("Invalid port in address '{}'", address))?;
                Ok((host.to_string(), port))
            }
            None => {
                let port = self
                    .default_port
                    .ok_or_else(|| anyhow!("No port in '{}' and no default port", address))?;
                Ok((address.to_string(), port))
            }
        }
    }
}

/// Common contract of all connectors.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connector family.
    fn kind(&self) -> TransportKind;

    /// Open the connection described by `settings`.
    async fn open(&mut self, settings: &TransportSettings) -> Result<()>;

    /// Send a command without reading a reply.
    async fn write(&mut self, command: &str) -> Result<()>;

    /// Send a command and read its reply.
    ///
    /// `Ok(None)` means the command was dropped without I/O (for example an
    /// unsupported register operation).
    async fn query(&mut self, command: &str, delay: Option<Duration>) -> Result<Option<String>>;

    /// Release the connection.
    async fn close(&mut self) -> Result<()>;

    /// True between a successful `open` and `close`.
    fn is_open(&self) -> bool;
}

/// Construct the connector for `kind`. Returns `None` for [`TransportKind::None`].
pub fn build(kind: TransportKind) -> Option<Box<dyn Transport>> {
    match kind {
        TransportKind::PointToPoint => Some(Box::new(PointToPointAdapter::new())),
        TransportKind::Socket => Some(Box::new(SocketAdapter::new())),
        TransportKind::Modbus => Some(Box::new(ModbusAdapter::new())),
        TransportKind::None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_address() {
        assert_eq!(
            TransportKind::from_address("ASRL/dev/ttyUSB0::INSTR"),
            TransportKind::PointToPoint
        );
        assert_eq!(
            TransportKind::from_address("GPIB0::5::INSTR"),
            TransportKind::PointToPoint
        );
        assert_eq!(
            TransportKind::from_address("TCPIP0::10.0.0.2::5025::SOCKET"),
            TransportKind::PointToPoint
        );
        assert_eq!(
            TransportKind::from_address("192.168.1.5:5025"),
            TransportKind::Socket
        );
        assert_eq!(TransportKind::from_address(""), TransportKind::None);
        assert_eq!(TransportKind::from_address("None"), TransportKind::None);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("modbus".parse::<TransportKind>().unwrap(), TransportKind::Modbus);
        assert_eq!("visa".parse::<TransportKind>().unwrap(), TransportKind::PointToPoint);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_socket_target_splits_on_last_colon() {
        let settings = TransportSettings::new("lab-psu.local:5025");
        assert_eq!(
            settings.socket_target().unwrap(),
            ("lab-psu.local".to_string(), 5025)
        );
    }

    #[test]
    fn test_socket_target_uses_default_port() {
        let mut settings = TransportSettings::new("10.0.0.7");
        assert!(settings.socket_target().is_err());
        settings.default_port = Some(502);
        assert_eq!(settings.socket_target().unwrap(), ("10.0.0.7".to_string(), 502));
    }

    #[test]
    fn test_terminator_overrides() {
        let mut settings = TransportSettings::new("host:1");
        assert_eq!(settings.read_terminator(), "\n");
        settings.read_termination = Some("\r\n".into());
        assert_eq!(settings.read_terminator(), "\r\n");
        assert_eq!(settings.write_terminator(), "\n");
    }

    #[test]
    fn test_encodings() {
        assert!(Encoding::Ascii.encode("µA").is_err());
        assert_eq!(Encoding::Latin1.encode("µ").unwrap(), vec![0xB5]);
        assert_eq!(Encoding::Latin1.decode(&[0xB5]), "µ");
        assert_eq!(Encoding::Utf8.decode("µ".as_bytes()), "µ");
        assert_eq!("latin-1".parse::<Encoding>().unwrap(), Encoding::Latin1);
    }

    #[test]
    fn test_build() {
        assert!(build(TransportKind::None).is_none());
        let socket = build(TransportKind::Socket).unwrap();
        assert_eq!(socket.kind(), TransportKind::Socket);
        assert!(!socket.is_open());
    }
}

//! Text grammar of the remote proxy.
//!
//! Two channels carry plain, newline framed text:
//!
//! - the handshake channel (request/reply): `APP <publish address>`, `STOP`,
//!   `LIST_PARAMETERS`, answered by a [`Welcome`], [`ACK`], a JSON parameter
//!   list or an `ERROR ...` line;
//! - the data channel (publish/subscribe), topic-filtered on the first token:
//!   [`DataRequest`] lines from the consumer and [`Reading`] lines from the
//!   exposer.

use crate::core::ParameterValue;
use crate::error::{HwError, HwResult};
use chrono::{DateTime, Utc};
use std::fmt;

/// Handshake request opening a session.
pub const APP: &str = "APP";
/// Handshake request ending a session.
pub const STOP: &str = "STOP";
/// Handshake request for the capability surface.
pub const LIST_PARAMETERS: &str = "LIST_PARAMETERS";
/// Reply to `STOP`.
pub const ACK: &str = "ACK";
/// Prefix of every error reply.
pub const ERROR_PREFIX: &str = "ERROR";

/// Format an error reply.
pub fn error_reply(message: impl fmt::Display) -> String {
    format!("{} {}", ERROR_PREFIX, message)
}

/// Reply sent for a message outside the handshake grammar.
pub fn unknown_command_reply(message: &str) -> String {
    error_reply(format_args!("unknown command '{}'", message))
}

/// Fails with [`HwError::Protocol`] if `reply` is an error reply.
pub fn check_reply(reply: &str) -> HwResult<&str> {
    match reply.strip_prefix(ERROR_PREFIX) {
        Some(rest) if rest.is_empty() || rest.starts_with(' ') => {
            Err(HwError::Protocol(rest.trim().to_string()))
        }
        _ => Ok(reply),
    }
}

/// Message received on the handshake channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// `APP <address>`: open a session, publishing to `address`.
    App {
        /// Consumer endpoint the exposer subscribes to.
        publish_address: String,
    },
    /// `STOP`
    Stop,
    /// `LIST_PARAMETERS`
    ListParameters,
    /// Anything else, kept verbatim.
    Unknown(String),
}

impl ControlMessage {
    /// Classify a handshake line; never fails.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(APP), Some(address), None) => ControlMessage::App {
                publish_address: address.to_string(),
            },
            (Some(STOP), None, None) => ControlMessage::Stop,
            (Some(LIST_PARAMETERS), None, None) => ControlMessage::ListParameters,
            _ => ControlMessage::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::App { publish_address } => write!(f, "{} {}", APP, publish_address),
            ControlMessage::Stop => write!(f, "{}", STOP),
            ControlMessage::ListParameters => write!(f, "{}", LIST_PARAMETERS),
            ControlMessage::Unknown(text) => write!(f, "{}", text),
        }
    }
}

/// Reply to `APP`: `<name> <host> <publish port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    /// Name of the exposed instrument.
    pub name: String,
    /// Host of the exposer's publisher.
    pub host: String,
    /// Port of the exposer's publisher.
    pub port: u16,
}

impl Welcome {
    /// Parse a reply to `APP`; an `ERROR` reply becomes [`HwError::Protocol`].
    pub fn parse(line: &str) -> HwResult<Self> {
        let reply = check_reply(line.trim())?;
        let tokens: Vec<&str> = reply.split_whitespace().collect();
        let [name, host, port] = tokens.as_slice() else {
            return Err(HwError::Protocol(format!(
                "expected '<name> <host> <port>', got '{}'",
                reply
            )));
        };
        let port = port
            .parse()
            .map_err(|_| HwError::Protocol(format!("bad publish port '{}'", port)))?;
        Ok(Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Welcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.host, self.port)
    }
}

/// What a [`DataRequest`] asks the instrument to do.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAction {
    /// `set <parameter> <value>`
    Set {
        /// Target parameter.
        parameter: String,
        /// Application-side value.
        value: ParameterValue,
    },
    /// `get <parameter>`: read and publish the value
    Get {
        /// Parameter to read.
        parameter: String,
    },
    /// `command <name>`
    Command {
        /// Registered command name.
        name: String,
    },
}

/// Consumer to exposer message: `<instrument> <priority> <action ...>`.
///
/// A set value keeps any inner whitespace.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRequest {
    /// Topic: the remote instrument name.
    pub instrument: String,
    /// 0 is served first.
    pub priority: u8,
    /// What to do.
    pub action: RequestAction,
}

impl DataRequest {
    /// `set` request.
    pub fn set(
        instrument: impl Into<String>,
        priority: u8,
        parameter: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            priority,
            action: RequestAction::Set {
                parameter: parameter.into(),
                value: value.into(),
            },
        }
    }

    /// `get` request.
    pub fn get(instrument: impl Into<String>, priority: u8, parameter: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            priority,
            action: RequestAction::Get {
                parameter: parameter.into(),
            },
        }
    }

    /// `command` request.
    pub fn command(instrument: impl Into<String>, priority: u8, name: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            priority,
            action: RequestAction::Command { name: name.into() },
        }
    }

    /// Parse `<instrument> <priority> <verb> <rest>`.
    pub fn parse(line: &str) -> HwResult<Self> {
        let bad = || HwError::Protocol(format!("malformed data request '{}'", line));

        let mut head = line.trim().splitn(4, char::is_whitespace);
        let (Some(instrument), Some(priority), Some(verb), Some(rest)) =
            (head.next(), head.next(), head.next(), head.next())
        else {
            return Err(bad());
        };
        let priority = priority
            .parse::<u8>()
            .map_err(|_| HwError::Protocol(format!("bad priority '{}' in '{}'", priority, line)))?;
        let rest = rest.trim();

        let action = match verb {
            "set" => {
                let (parameter, value) = rest.split_once(char::is_whitespace).ok_or_else(bad)?;
                RequestAction::Set {
                    parameter: parameter.to_string(),
                    value: ParameterValue::parse_wire(value.trim()),
                }
            }
            "get" if !rest.contains(char::is_whitespace) => RequestAction::Get {
                parameter: rest.to_string(),
            },
            "command" if !rest.contains(char::is_whitespace) => RequestAction::Command {
                name: rest.to_string(),
            },
            _ => return Err(bad()),
        };
        Ok(Self {
            instrument: instrument.to_string(),
            priority,
            action,
        })
    }
}

impl fmt::Display for DataRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.instrument, self.priority)?;
        match &self.action {
            RequestAction::Set { parameter, value } => write!(f, "set {} {}", parameter, value),
            RequestAction::Get { parameter } => write!(f, "get {}", parameter),
            RequestAction::Command { name } => write!(f, "command {}", name),
        }
    }
}

/// Exposer to consumer message: `<instrument> <parameter> <value>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    /// Publishing instrument.
    pub instrument: String,
    /// Parameter the value belongs to.
    pub parameter: String,
    /// Value as received, always text.
    pub value: ParameterValue,
    /// Local receive (or creation) time, not sent on the wire.
    pub received_at: DateTime<Utc>,
}

impl Reading {
    /// Reading stamped with the current time.
    pub fn new(
        instrument: impl Into<String>,
        parameter: impl Into<String>,
        value: impl Into<ParameterValue>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            parameter: parameter.into(),
            value: value.into(),
            received_at: Utc::now(),
        }
    }

    /// Parse a published line; the value is everything after the parameter.
    pub fn parse(line: &str) -> HwResult<Self> {
        let mut tokens = line.trim().splitn(3, char::is_whitespace);
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(instrument), Some(parameter), Some(value)) if !value.trim().is_empty() => {
                Ok(Self::new(
                    instrument,
                    parameter,
                    ParameterValue::parse_wire(value.trim()),
                ))
            }
            _ => Err(HwError::Protocol(format!(
                "'{}' is not '<instrument> <parameter> <value>'",
                line.trim()
            ))),
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.instrument, self.parameter, self.value)
    }
}

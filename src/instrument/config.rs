//! Declarative instrument definitions.
//!
//! A concrete driver's vocabulary is configuration data: the commands to read
//! and set each parameter, optional lookup tables and scale factors, and dummy
//! values for simulation. [`Instrument::from_definition`] turns one such
//! definition into a ready instrument.
//!
//! # Examples
//!
//! ```toml
//! [[instruments]]
//! name = "PSU"
//! address = "TCPIP0::192.168.1.20::5025::SOCKET"
//! termination = "\r\n"
//! check_commands = ["*IDN?"]
//!
//! [[instruments.parameters]]
//! name = "VOLT"
//! read = "MEAS:VOLT?"
//! set = "VOLT {}"
//! dummy = 0.0
//!
//! [[instruments.parameters]]
//! name = "OUTPUT"
//! read = "OUTP?"
//! set = "OUTP {}"
//! lookup = { True = "1", False = "0" }
//! dummy = "False"
//!
//! [[instruments.commands]]
//! name = "RESET"
//! write = "*RST"
//! ```

use super::hooks::{Hook, ParseFloatHook, ScaleHook};
use super::{Instrument, ParameterSpec};
use crate::adapters::{Encoding, SerialSettings, TransportKind};
use crate::core::ParameterValue;
use crate::error::{HwError, HwResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn default_address() -> String {
    "None".to_string()
}

fn default_termination() -> String {
    "\n".to_string()
}

/// One parameter of a declarative instrument.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ParameterDefinition {
    /// Parameter name
    pub name: String,
    /// Query sent to read the parameter
    pub read: Option<String>,
    /// Set template with one `{}` slot
    pub set: Option<String>,
    /// Value returned in dummy mode
    pub dummy: Option<ParameterValue>,
    /// Application value to wire token table
    pub lookup: Option<BTreeMap<String, String>>,
    /// Read replies are multiplied by this factor, set values divided by it
    pub scale: Option<f64>,
}

/// One command of a declarative instrument.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandDefinition {
    /// Command name
    pub name: String,
    /// String written to the instrument
    pub write: String,
}

/// Everything needed to build an [`Instrument`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstrumentDefinition {
    /// Unique instrument name
    pub name: String,
    /// Connection address (`None` for no connection)
    #[serde(default = "default_address")]
    pub address: String,
    /// Explicit transport, overriding the one inferred from the address
    pub transport: Option<TransportKind>,
    /// Start in dummy mode
    #[serde(default)]
    pub dummy: bool,
    /// Manufacturer
    pub manufacturer: Option<String>,
    /// Model
    pub model: Option<String>,
    /// Generic terminator
    #[serde(default = "default_termination")]
    pub termination: String,
    /// Reply terminator override
    pub read_termination: Option<String>,
    /// Command terminator override
    pub write_termination: Option<String>,
    /// Text encoding
    #[serde(default)]
    pub encoding: Encoding,
    /// I/O timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Pause after connecting, in milliseconds
    #[serde(default)]
    pub startup_delay_ms: u64,
    /// Pause between query write and read, in milliseconds
    pub delay_ms: Option<u64>,
    /// Port used when the address has none
    pub default_port: Option<u16>,
    /// Serial line settings
    #[serde(default)]
    pub serial: SerialSettings,
    /// Queries used to verify the connection
    #[serde(default)]
    pub check_commands: Vec<String>,
    /// Parameters
    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,
    /// Commands
    #[serde(default)]
    pub commands: Vec<CommandDefinition>,
}

impl InstrumentDefinition {
    /// Minimal definition with no vocabulary.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            transport: None,
            dummy: false,
            manufacturer: None,
            model: None,
            termination: default_termination(),
            read_termination: None,
            write_termination: None,
            encoding: Encoding::default(),
            timeout_ms: None,
            startup_delay_ms: 0,
            delay_ms: None,
            default_port: None,
            serial: SerialSettings::default(),
            check_commands: Vec::new(),
            parameters: Vec::new(),
            commands: Vec::new(),
        }
    }

    /// Creates a definition from a TOML value.
    pub fn from_toml(value: &toml::Value) -> HwResult<Self> {
        value
            .clone()
            .try_into()
            .map_err(|e: toml::de::Error| HwError::Configuration(e.to_string()))
    }

    /// Validates the definition.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    /// - the name is empty or contains whitespace
    /// - a parameter combines `lookup` and `scale`, or has a zero/non-finite scale
    /// - `timeout_ms` is zero
    pub fn validate(&self) -> HwResult<()> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(HwError::Configuration(format!(
                "instrument name '{}' must be non-empty without whitespace",
                self.name
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(HwError::Configuration(format!(
                "{}: timeout_ms must be greater than 0",
                self.name
            )));
        }
        for p in &self.parameters {
            if p.lookup.is_some() && p.scale.is_some() {
                return Err(HwError::Configuration(format!(
                    "{}.{}: lookup and scale cannot be combined",
                    self.name, p.name
                )));
            }
            if let Some(scale) = p.scale {
                if !scale.is_finite() || scale == 0.0 {
                    return Err(HwError::Configuration(format!(
                        "{}.{}: scale must be finite and non-zero, got {}",
                        self.name, p.name, scale
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Instrument {
    /// Build an instrument from a definition.
    ///
    /// Fails on an invalid definition or on the first rejected registration.
    pub fn from_definition(definition: &InstrumentDefinition) -> HwResult<Self> {
        definition.validate()?;

        let mut instrument = Instrument::new(&definition.name, &definition.address);
        if let Some(kind) = definition.transport {
            instrument.set_transport_kind(kind);
        }
        if let (Some(manufacturer), Some(model)) = (&definition.manufacturer, &definition.model) {
            instrument.set_identity(manufacturer, model);
        }

        let settings = instrument.settings_mut();
        settings.termination = definition.termination.clone();
        settings.read_termination = definition.read_termination.clone();
        settings.write_termination = definition.write_termination.clone();
        settings.encoding = definition.encoding;
        settings.timeout = definition.timeout_ms.map(Duration::from_millis);
        settings.startup_delay = Duration::from_millis(definition.startup_delay_ms);
        settings.delay = definition.delay_ms.map(Duration::from_millis);
        settings.default_port = definition.default_port;
        instrument.config_serial(definition.serial.clone());
        instrument.set_check_commands(definition.check_commands.clone());

        for p in &definition.parameters {
            let mut spec = ParameterSpec::new(&p.name);
            if let Some(read) = &p.read {
                spec = spec.read(read);
            }
            if let Some(set) = &p.set {
                spec = spec.set(set);
            }
            if let Some(dummy) = &p.dummy {
                spec = spec.dummy(dummy.clone());
            }
            if let Some(scale) = p.scale {
                let post: Vec<Hook> = vec![Arc::new(ParseFloatHook), Arc::new(ScaleHook::new(scale))];
                let pre: Vec<Hook> = vec![Arc::new(ScaleHook::new(1.0 / scale))];
                spec = spec.post_hooks(post).pre_hooks(pre);
            }
            instrument.add_parameter(spec)?;
            if let Some(table) = &p.lookup {
                instrument.add_lookup(&p.name, table.clone())?;
            }
        }
        for c in &definition.commands {
            instrument.add_command(&c.name, c.write.clone())?;
        }

        instrument.set_dummy(definition.dummy);
        Ok(instrument)
    }
}

//! Instrument capability model and connection state machine.
//!
//! An [`Instrument`] owns a [`Registry`] of named parameters and commands, the
//! settings of its connection, and (once connected) a boxed [`Transport`].
//! Callers only ever see [`get_value`](Instrument::get_value),
//! [`set_value`](Instrument::set_value) and [`command`](Instrument::command);
//! every failure below that surface ends as a log line plus `None` or a no-op.
//!
//! # Example
//!
//! ```
//! use rust_hwctl::adapters::MockTransport;
//! use rust_hwctl::instrument::{Instrument, ParameterSpec};
//!
//! # tokio_test::block_on(async {
//! let wire = MockTransport::new();
//! wire.reply("V?", "5.000");
//!
//! let mut psu = Instrument::new("PSU", "10.0.0.5:5025").with_transport(wire.clone());
//! psu.add_parameter(ParameterSpec::new("VOLT").read("V?").set("V {}")).unwrap();
//!
//! assert!(psu.try_connect().await);
//! psu.set_value("VOLT", 5).await;
//! assert_eq!(wire.writes(), vec!["V 5"]);
//! assert_eq!(psu.get_value("VOLT").await, Some("5.000".into()));
//! # })
//! ```

use crate::adapters::{self, SerialSettings, Transport, TransportKind, TransportSettings};
use crate::core::ParameterValue;
use crate::error::HwResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub mod config;
pub mod hooks;
pub mod registry;

pub use hooks::{apply_chain, Hook, LookupHook, Transform};
pub use registry::{
    CommandAction, DummyReturn, ParameterList, ParameterSpec, ReadCommand, Registry, SetCommand,
    IGNORE, ONLINE,
};

/// Connection state of an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, or the last I/O failed
    #[default]
    Offline,
    /// Connected and verified
    Online,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Offline => write!(f, "offline"),
            ConnectionState::Online => write!(f, "online"),
        }
    }
}

/// A physical or simulated device with a registered capability surface.
pub struct Instrument {
    name: String,
    manufacturer: Option<String>,
    model: Option<String>,
    settings: TransportSettings,
    check_commands: Vec<String>,
    state: ConnectionState,
    dummy: bool,
    transport: Option<Box<dyn Transport>>,
    registry: Registry,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("address", &self.settings.address)
            .field("kind", &self.settings.kind)
            .field("state", &self.state)
            .field("dummy", &self.dummy)
            .finish()
    }
}

impl Instrument {
    /// Create an offline instrument; the transport kind is inferred from `address`.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: None,
            model: None,
            settings: TransportSettings::new(address),
            check_commands: Vec::new(),
            state: ConnectionState::Offline,
            dummy: false,
            transport: None,
            registry: Registry::new(),
        }
    }

    /// Use `transport` instead of the connector implied by the address.
    pub fn with_transport<T: Transport + 'static>(mut self, transport: T) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    /// Replace the transport. The instrument goes offline.
    pub fn set_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.state = ConnectionState::Offline;
    }

    /// Instrument name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Manufacturer, if known.
    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    /// Model, if known.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Set descriptive manufacturer and model.
    pub fn set_identity(&mut self, manufacturer: impl Into<String>, model: impl Into<String>) {
        self.manufacturer = Some(manufacturer.into());
        self.model = Some(model.into());
    }

    /// Connection settings.
    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    /// Mutable connection settings; changes apply at the next `try_connect`.
    pub fn settings_mut(&mut self) -> &mut TransportSettings {
        &mut self.settings
    }

    /// Select the transport kind explicitly (Modbus is never inferred).
    pub fn set_transport_kind(&mut self, kind: TransportKind) {
        if self.settings.kind != kind {
            self.settings.kind = kind;
            self.transport = None;
            self.state = ConnectionState::Offline;
        }
    }

    /// Serial line parameters for point-to-point connections.
    pub fn config_serial(&mut self, serial: SerialSettings) {
        self.settings.serial = serial;
    }

    /// Commands queried by [`check_connection`](Self::check_connection).
    pub fn set_check_commands(&mut self, commands: Vec<String>) {
        self.check_commands = commands;
    }

    /// Enable or disable dummy mode.
    pub fn set_dummy(&mut self, dummy: bool) {
        if self.dummy != dummy {
            self.dummy = dummy;
            self.state = ConnectionState::Offline;
        }
    }

    /// True in dummy mode.
    pub fn is_dummy(&self) -> bool {
        self.dummy
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// True when online.
    pub fn is_online(&self) -> bool {
        self.state == ConnectionState::Online
    }

    /// Registered capabilities.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ---- registration ----

    /// Register a parameter. A rejected spec is logged and leaves the registry unchanged.
    pub fn add_parameter(&mut self, spec: ParameterSpec) -> HwResult<()> {
        self.registry
            .register(spec)
            .inspect_err(|e| error!("({}) {}", self.name, e))
    }

    /// Register a command that writes `command` to the instrument.
    pub fn add_command(&mut self, name: &str, command: impl Into<String>) -> HwResult<()> {
        self.registry
            .register_command(name, CommandAction::Write(command.into()))
            .inspect_err(|e| error!("({}) {}", self.name, e))
    }

    /// Register a command backed by a callable.
    pub fn add_command_with<F>(&mut self, name: &str, func: F) -> HwResult<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.registry
            .register_command(name, CommandAction::Function(Arc::new(func)))
            .inspect_err(|e| error!("({}) {}", self.name, e))
    }

    /// Append a pre-hook to `parameter`.
    pub fn add_pre_hook(&mut self, parameter: &str, hook: Hook) -> HwResult<()> {
        self.registry
            .append_pre_hook(parameter, hook)
            .inspect_err(|e| error!("({}) {}", self.name, e))
    }

    /// Append a post-hook to `parameter`.
    pub fn add_post_hook(&mut self, parameter: &str, hook: Hook) -> HwResult<()> {
        self.registry
            .append_post_hook(parameter, hook)
            .inspect_err(|e| error!("({}) {}", self.name, e))
    }

    /// Install a lookup table as pre-hook and its inverse as post-hook.
    pub fn add_lookup<I, K, V>(&mut self, parameter: &str, table: I) -> HwResult<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let lookup = LookupHook::new(parameter, table);
        let inverse = lookup.inverse();
        self.add_pre_hook(parameter, Arc::new(lookup))?;
        self.add_post_hook(parameter, Arc::new(inverse))
    }

    /// Readable, settable and command names. Reads always include `ONLINE`.
    pub fn list_parameters(&self) -> ParameterList {
        self.registry.list()
    }

    // ---- access ----

    /// Read a parameter.
    ///
    /// `ONLINE` reports the connection state. In dummy mode the registered
    /// dummy value is returned without I/O. Otherwise the read descriptor runs
    /// and its result passes through the post-hook chain.
    pub async fn get_value(&mut self, parameter: &str) -> Option<ParameterValue> {
        if parameter == ONLINE {
            return Some(ParameterValue::Bool(self.is_online()));
        }

        if self.dummy {
            return match self.registry.dummy_return(parameter) {
                Some(DummyReturn::Value(value)) => Some(value.clone()),
                Some(DummyReturn::Generator(generate)) => {
                    let value = generate();
                    if value.is_none() {
                        error!(
                            "({}) dummy generator for '{}' returned no value",
                            self.name, parameter
                        );
                    }
                    value
                }
                None => {
                    error!(
                        "Parameter '{}' requested from instrument '{}' in dummy mode, but no dummy return is defined",
                        parameter, self.name
                    );
                    None
                }
            };
        }

        let raw = match self.registry.read_command(parameter).cloned() {
            Some(ReadCommand::Function(read)) => read(),
            Some(ReadCommand::Query(query)) => self
                .query(&query, None)
                .await
                .map(ParameterValue::String),
            None => {
                error!(
                    "Parameter '{}' is not readable in instrument '{}'",
                    parameter, self.name
                );
                return None;
            }
        }?;
        apply_chain(parameter, self.registry.post_hooks(parameter), raw)
    }

    /// Set a parameter.
    ///
    /// The value runs through the pre-hook chain first; if a hook vetoes it,
    /// nothing is sent.
    pub async fn set_value(&mut self, parameter: &str, value: impl Into<ParameterValue>) {
        let Some(set) = self.registry.set_command(parameter).cloned() else {
            error!(
                "Parameter '{}' is not settable in instrument '{}'",
                parameter, self.name
            );
            return;
        };
        let Some(value) = apply_chain(parameter, self.registry.pre_hooks(parameter), value.into())
        else {
            debug!("({}) set of '{}' abandoned by hook", self.name, parameter);
            return;
        };
        match &set {
            SetCommand::Function(apply) => apply(value),
            SetCommand::Template(_) => {
                if let Some(command) = set.render(&value) {
                    self.write(&command).await;
                }
            }
        }
    }

    /// Run a registered command. In dummy mode only logs what would be sent.
    pub async fn command(&mut self, name: &str) {
        let Some(action) = self.registry.command(name).cloned() else {
            error!("Command '{}' not available in instrument '{}'", name, self.name);
            return;
        };
        if self.dummy {
            debug!("{}: would call {} -> {:?}", self.name, name, action);
            return;
        }
        match action {
            CommandAction::Function(run) => run(),
            CommandAction::Write(command) => self.write(&command).await,
        }
    }

    /// Write a raw command.
    ///
    /// Does nothing while offline and only logs in dummy mode. A transport
    /// failure is logged and takes the instrument offline.
    pub async fn write(&mut self, command: &str) {
        if !self.is_online() {
            debug!("({}) offline, not writing '{}'", self.name, command);
            return;
        }
        if self.dummy {
            debug!("{} sending write command {}", self.name, command);
            return;
        }
        let Some(transport) = self.transport.as_mut() else {
            error!("Write '{}' failed in {}: no transport", command, self.name);
            self.state = ConnectionState::Offline;
            return;
        };
        debug!("write: '{}' to '{}'", command, self.name);
        if let Err(e) = transport.write(command).await {
            error!("Write '{}' failed in {}: {:#}", command, self.name, e);
            self.state = ConnectionState::Offline;
        }
    }

    /// Send a raw query and return the reply.
    ///
    /// `delay` overrides the configured pause between write and read. Same
    /// gating and failure handling as [`write`](Self::write).
    pub async fn query(&mut self, command: &str, delay: Option<Duration>) -> Option<String> {
        if !self.is_online() {
            debug!("({}) offline, not querying '{}'", self.name, command);
            return None;
        }
        if self.dummy {
            debug!("'{}' sending query command '{}'", self.name, command);
            return None;
        }
        let Some(transport) = self.transport.as_mut() else {
            error!("Query '{}' failed in {}: no transport", command, self.name);
            self.state = ConnectionState::Offline;
            return None;
        };
        debug!("'{}' sending query command '{}'", self.name, command);
        match transport.query(command, delay).await {
            Ok(reply) => reply,
            Err(e) => {
                error!("Query '{}' failed in {}: {:#}", command, self.name, e);
                self.state = ConnectionState::Offline;
                None
            }
        }
    }

    // ---- lifecycle ----

    /// Connect, or re-validate an existing connection.
    ///
    /// Returns the resulting online flag. Dummy instruments go online at once.
    pub async fn try_connect(&mut self) -> bool {
        if self.dummy {
            if !self.is_online() {
                debug!("{}: creating dummy connection", self.name);
                self.state = ConnectionState::Online;
            }
            return true;
        }

        if self.is_online() {
            if self.check_connection().await {
                return true;
            }
            self.state = ConnectionState::Offline;
        }

        debug!("{}: trying to connect", self.name);
        if self.transport.is_none() {
            self.transport = adapters::build(self.settings.kind);
        }
        let Some(transport) = self.transport.as_mut() else {
            debug!("{}: no transport configured, staying offline", self.name);
            return false;
        };

        if transport.is_open() {
            if let Err(e) = transport.close().await {
                warn!("({}) closing stale connection failed: {:#}", self.name, e);
            }
        }

        let kind = transport.kind();
        match transport.open(&self.settings).await {
            Ok(()) => {
                info!(
                    "Opened {} connection to {} at {}",
                    kind, self.name, self.settings.address
                );
                self.state = ConnectionState::Online;
            }
            Err(e) => {
                error!(
                    "({}) received the following error connecting with {}: {:#}",
                    self.name, kind, e
                );
                debug!("{} is offline", self.name);
                self.state = ConnectionState::Offline;
            }
        }

        if !self.settings.startup_delay.is_zero() {
            tokio::time::sleep(self.settings.startup_delay).await;
        }
        if self.is_online() && !self.check_connection().await {
            self.state = ConnectionState::Offline;
        }
        self.is_online()
    }

    /// Query every check command; `true` if still online afterwards.
    ///
    /// Always `false` while offline; `true` with no check commands configured.
    pub async fn check_connection(&mut self) -> bool {
        if !self.is_online() {
            return false;
        }
        for command in self.check_commands.clone() {
            self.query(&command, None).await;
        }
        self.is_online()
    }

    /// Close the transport. The instrument is offline afterwards.
    pub async fn close(&mut self) {
        if self.dummy {
            debug!("{}: dummy connection closed", self.name);
        } else if let Some(transport) = self.transport.as_mut() {
            match transport.close().await {
                Ok(()) => debug!("{}: connection closed", self.name),
                Err(e) => warn!("({}) close failed: {:#}", self.name, e),
            }
        } else {
            debug!("{}: close called with no transport", self.name);
        }
        self.state = ConnectionState::Offline;
    }
}

//! Capability registry: the named parameters and commands an instrument exposes.
//!
//! The registry owns one insertion-ordered map per descriptor kind (reads, sets,
//! commands, pre-hooks, post-hooks, dummy returns). A parameter is added in one
//! piece through a [`ParameterSpec`]; the whole spec is validated before any map
//! is touched, so a rejected registration leaves the registry unchanged.

use crate::core::ParameterValue;
use crate::error::{HwError, HwResult};
use crate::instrument::hooks::Hook;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Synthetic read-only parameter reporting the connection state.
pub const ONLINE: &str = "ONLINE";

/// Token reserved for "no parameter" by consumers of the registry.
pub const IGNORE: &str = "IGNORE";

/// Names no parameter may take.
pub const RESERVED_NAMES: [&str; 2] = [ONLINE, IGNORE];

/// Zero-argument read callable.
pub type ReadFn = Arc<dyn Fn() -> Option<ParameterValue> + Send + Sync>;

/// One-argument set callable.
pub type SetFn = Arc<dyn Fn(ParameterValue) + Send + Sync>;

/// Zero-argument command callable.
pub type CommandFn = Arc<dyn Fn() + Send + Sync>;

/// How a parameter is read.
#[derive(Clone)]
pub enum ReadCommand {
    /// Literal query sent through the transport.
    Query(String),
    /// Callable producing the value without a query.
    Function(ReadFn),
}

/// How a parameter is set.
#[derive(Clone)]
pub enum SetCommand {
    /// Command template; the first `{}` is replaced by the value.
    Template(String),
    /// Callable receiving the transformed value.
    Function(SetFn),
}

impl SetCommand {
    /// Render the wire command for `value`.
    ///
    /// Returns `None` for callables.
    pub fn render(&self, value: &ParameterValue) -> Option<String> {
        match self {
            SetCommand::Template(template) => {
                Some(template.replacen("{}", &value.to_string(), 1))
            }
            SetCommand::Function(_) => None,
        }
    }
}

/// How a command is issued.
#[derive(Clone)]
pub enum CommandAction {
    /// Literal string written to the transport.
    Write(String),
    /// Callable run instead of a write.
    Function(CommandFn),
}

/// Value substituted for a read in dummy mode.
#[derive(Clone)]
pub enum DummyReturn {
    /// Fixed value.
    Value(ParameterValue),
    /// Generator called on every read.
    Generator(ReadFn),
}

impl fmt::Debug for ReadCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadCommand::Query(q) => f.debug_tuple("Query").field(q).finish(),
            ReadCommand::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl fmt::Debug for SetCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SetCommand::Template(t) => f.debug_tuple("Template").field(t).finish(),
            SetCommand::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl fmt::Debug for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandAction::Write(w) => f.debug_tuple("Write").field(w).finish(),
            CommandAction::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl fmt::Debug for DummyReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DummyReturn::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DummyReturn::Generator(_) => f.write_str("Generator(..)"),
        }
    }
}

/// Everything known about one parameter, registered in a single call.
///
/// ```
/// use rust_hwctl::instrument::ParameterSpec;
///
/// let volt = ParameterSpec::new("VOLT").read("V?").set("V {}").dummy(0.0);
/// assert_eq!(volt.name(), "VOLT");
/// ```
#[derive(Clone)]
pub struct ParameterSpec {
    name: String,
    read: Option<ReadCommand>,
    set: Option<SetCommand>,
    pre_hooks: Vec<Hook>,
    post_hooks: Vec<Hook>,
    dummy: Option<DummyReturn>,
}

impl ParameterSpec {
    /// Start a spec for `name` with no descriptors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read: None,
            set: None,
            pre_hooks: Vec::new(),
            post_hooks: Vec::new(),
            dummy: None,
        }
    }

    /// Parameter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read through a literal query.
    pub fn read(mut self, query: impl Into<String>) -> Self {
        self.read = Some(ReadCommand::Query(query.into()));
        self
    }

    /// Read through a callable.
    pub fn read_with<F>(mut self, func: F) -> Self
    where
        F: Fn() -> Option<ParameterValue> + Send + Sync + 'static,
    {
        self.read = Some(ReadCommand::Function(Arc::new(func)));
        self
    }

    /// Set through a command template containing `{}`.
    pub fn set(mut self, template: impl Into<String>) -> Self {
        self.set = Some(SetCommand::Template(template.into()));
        self
    }

    /// Set through a callable.
    pub fn set_with<F>(mut self, func: F) -> Self
    where
        F: Fn(ParameterValue) + Send + Sync + 'static,
    {
        self.set = Some(SetCommand::Function(Arc::new(func)));
        self
    }

    /// Pre-hook chain run before a set.
    pub fn pre_hooks(mut self, hooks: Vec<Hook>) -> Self {
        self.pre_hooks = hooks;
        self
    }

    /// Post-hook chain run after a read.
    pub fn post_hooks(mut self, hooks: Vec<Hook>) -> Self {
        self.post_hooks = hooks;
        self
    }

    /// Fixed value returned in dummy mode.
    pub fn dummy(mut self, value: impl Into<ParameterValue>) -> Self {
        self.dummy = Some(DummyReturn::Value(value.into()));
        self
    }

    /// Generator called for every dummy-mode read.
    pub fn dummy_with<F>(mut self, func: F) -> Self
    where
        F: Fn() -> Option<ParameterValue> + Send + Sync + 'static,
    {
        self.dummy = Some(DummyReturn::Generator(Arc::new(func)));
        self
    }
}

/// Capability surface of an instrument: readable, settable and command names.
///
/// Serializes as a JSON array of three string arrays, the form sent in reply
/// to `LIST_PARAMETERS`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(Vec<String>, Vec<String>, Vec<String>)")]
#[serde(into = "(Vec<String>, Vec<String>, Vec<String>)")]
pub struct ParameterList {
    /// Readable parameters; always ends with `ONLINE`.
    pub reads: Vec<String>,
    /// Settable parameters.
    pub sets: Vec<String>,
    /// Commands.
    pub commands: Vec<String>,
}

impl From<(Vec<String>, Vec<String>, Vec<String>)> for ParameterList {
    fn from((reads, sets, commands): (Vec<String>, Vec<String>, Vec<String>)) -> Self {
        Self {
            reads,
            sets,
            commands,
        }
    }
}

impl From<ParameterList> for (Vec<String>, Vec<String>, Vec<String>) {
    fn from(list: ParameterList) -> Self {
        (list.reads, list.sets, list.commands)
    }
}

impl ParameterList {
    /// Encode as the JSON capability reply.
    pub fn to_json(&self) -> HwResult<String> {
        serde_json::to_string(self).map_err(|e| HwError::Protocol(e.to_string()))
    }

    /// Decode a JSON capability reply.
    pub fn from_json(text: &str) -> HwResult<Self> {
        serde_json::from_str(text.trim())
            .map_err(|e| HwError::Protocol(format!("bad parameter list '{}': {}", text, e)))
    }
}

/// Descriptor maps of one instrument.
#[derive(Default, Clone)]
pub struct Registry {
    reads: IndexMap<String, ReadCommand>,
    sets: IndexMap<String, SetCommand>,
    commands: IndexMap<String, CommandAction>,
    pre_hooks: IndexMap<String, Vec<Hook>>,
    post_hooks: IndexMap<String, Vec<Hook>>,
    dummy_returns: IndexMap<String, DummyReturn>,
}

fn check_name(kind: &str, name: &str) -> HwResult<()> {
    if name.is_empty() {
        return Err(HwError::Registration(format!("{} name is empty", kind)));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(HwError::Registration(format!(
            "{} name '{}' is reserved",
            kind, name
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(HwError::Registration(format!(
            "{} name '{}' contains whitespace",
            kind, name
        )));
    }
    Ok(())
}

fn duplicate(what: &str, name: &str) -> HwError {
    HwError::Registration(format!("{} for '{}' already registered", what, name))
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter. Either everything in `spec` is registered or nothing is.
    pub fn register(&mut self, spec: ParameterSpec) -> HwResult<()> {
        let name = spec.name.as_str();
        check_name("parameter", name)?;

        if spec.read.is_some() && self.reads.contains_key(name) {
            return Err(duplicate("read command", name));
        }
        if spec.set.is_some() && self.sets.contains_key(name) {
            return Err(duplicate("set command", name));
        }
        if !spec.pre_hooks.is_empty() && self.pre_hooks.contains_key(name) {
            return Err(duplicate("pre-hooks", name));
        }
        if !spec.post_hooks.is_empty() && self.post_hooks.contains_key(name) {
            return Err(duplicate("post-hooks", name));
        }
        if let Some(dummy) = &spec.dummy {
            if self.dummy_returns.contains_key(name) {
                return Err(duplicate("dummy return", name));
            }
            if let DummyReturn::Value(value) = dummy {
                if value.contains_whitespace() {
                    return Err(HwError::Registration(format!(
                        "dummy return '{}' for '{}' contains whitespace",
                        value, name
                    )));
                }
            }
        }

        let ParameterSpec {
            name,
            read,
            set,
            pre_hooks,
            post_hooks,
            dummy,
        } = spec;

        if let Some(read) = read {
            self.reads.insert(name.clone(), read);
        }
        if let Some(set) = set {
            self.sets.insert(name.clone(), set);
        }
        if !pre_hooks.is_empty() {
            self.pre_hooks.insert(name.clone(), pre_hooks);
        }
        if !post_hooks.is_empty() {
            self.post_hooks.insert(name.clone(), post_hooks);
        }
        if let Some(dummy) = dummy {
            self.dummy_returns.insert(name, dummy);
        }
        Ok(())
    }

    /// Add a zero-argument command.
    pub fn register_command(&mut self, name: &str, action: CommandAction) -> HwResult<()> {
        check_name("command", name)?;
        if self.commands.contains_key(name) {
            return Err(duplicate("command", name));
        }
        self.commands.insert(name.to_string(), action);
        Ok(())
    }

    /// Append to the pre-hook chain of `name`, creating it if needed.
    pub fn append_pre_hook(&mut self, name: &str, hook: Hook) -> HwResult<()> {
        check_name("parameter", name)?;
        self.pre_hooks.entry(name.to_string()).or_default().push(hook);
        Ok(())
    }

    /// Append to the post-hook chain of `name`, creating it if needed.
    pub fn append_post_hook(&mut self, name: &str, hook: Hook) -> HwResult<()> {
        check_name("parameter", name)?;
        self.post_hooks
            .entry(name.to_string())
            .or_default()
            .push(hook);
        Ok(())
    }

    /// Read descriptor of `name`.
    pub fn read_command(&self, name: &str) -> Option<&ReadCommand> {
        self.reads.get(name)
    }

    /// Set descriptor of `name`.
    pub fn set_command(&self, name: &str) -> Option<&SetCommand> {
        self.sets.get(name)
    }

    /// Command descriptor of `name`.
    pub fn command(&self, name: &str) -> Option<&CommandAction> {
        self.commands.get(name)
    }

    /// Dummy substitute of `name`.
    pub fn dummy_return(&self, name: &str) -> Option<&DummyReturn> {
        self.dummy_returns.get(name)
    }

    /// Pre-hook chain of `name` (empty if none).
    pub fn pre_hooks(&self, name: &str) -> &[Hook] {
        self.pre_hooks.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Post-hook chain of `name` (empty if none).
    pub fn post_hooks(&self, name: &str) -> &[Hook] {
        self.post_hooks.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True if `name` has any descriptor, hook chain or dummy return.
    pub fn contains(&self, name: &str) -> bool {
        self.reads.contains_key(name)
            || self.sets.contains_key(name)
            || self.commands.contains_key(name)
            || self.pre_hooks.contains_key(name)
            || self.post_hooks.contains_key(name)
            || self.dummy_returns.contains_key(name)
    }

    /// Total number of registered entries across all maps.
    pub fn len(&self) -> usize {
        self.reads.len()
            + self.sets.len()
            + self.commands.len()
            + self.pre_hooks.len()
            + self.post_hooks.len()
            + self.dummy_returns.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capability surface in registration order, with `ONLINE` appended to reads.
    pub fn list(&self) -> ParameterList {
        let mut reads: Vec<String> = self.reads.keys().cloned().collect();
        reads.push(ONLINE.to_string());
        ParameterList {
            reads,
            sets: self.sets.keys().cloned().collect(),
            commands: self.commands.keys().cloned().collect(),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("reads", &self.reads)
            .field("sets", &self.sets)
            .field("commands", &self.commands)
            .field("pre_hooks", &self.pre_hooks.keys().collect::<Vec<_>>())
            .field("post_hooks", &self.post_hooks.keys().collect::<Vec<_>>())
            .field("dummy_returns", &self.dummy_returns)
            .finish()
    }
}

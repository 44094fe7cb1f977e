//! Value transforms applied around the wire.
//!
//! Pre-hooks run on a value before `set_value` formats it for the instrument,
//! post-hooks run on a raw reply before `get_value` hands it back. A chain is a
//! plain ordered slice of [`Hook`]s: each hook receives the previous hook's output,
//! and the first hook that returns `None` ends the chain with `None`.
//!
//! Hooks are pure. Anything a transform needs to know (a lookup table, a scale
//! factor, the current value of some other control) is handed to the transform
//! when it is constructed instead of being captured from surrounding state.
//!
//! # Example
//!
//! ```
//! use rust_hwctl::core::ParameterValue;
//! use rust_hwctl::instrument::hooks::{apply_chain, Hook, LookupHook, ScaleHook};
//! use std::sync::Arc;
//!
//! let to_wire = LookupHook::new("enable", [("True", "ON"), ("False", "OFF")]);
//! let from_wire: Hook = Arc::new(to_wire.inverse());
//! let chain: Vec<Hook> = vec![Arc::new(to_wire)];
//!
//! assert_eq!(apply_chain("enable", &chain, "True".into()), Some("ON".into()));
//! assert_eq!(apply_chain("enable", &[from_wire], "OFF".into()), Some("False".into()));
//!
//! let millivolts: Vec<Hook> = vec![Arc::new(ScaleHook::new(1000.0))];
//! assert_eq!(apply_chain("level", &millivolts, 0.5.into()), Some(500.0.into()));
//! ```

use crate::core::ParameterValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// A named, pure value transform.
pub trait Transform: Send + Sync {
    /// Name used in log messages.
    fn name(&self) -> &str;

    /// Transform `value`, or return `None` to veto it.
    fn apply(&self, value: ParameterValue) -> Option<ParameterValue>;
}

/// Shared handle to a transform, as stored in the registry.
pub type Hook = Arc<dyn Transform>;

/// Runs `hooks` in order, feeding each output into the next hook.
///
/// Returns `None` as soon as any hook does. An empty chain returns the
/// value unchanged. `parameter` only labels the log line.
pub fn apply_chain(
    parameter: &str,
    hooks: &[Hook],
    value: ParameterValue,
) -> Option<ParameterValue> {
    hooks.iter().try_fold(value, |current, hook| {
        let out = hook.apply(current);
        if out.is_none() {
            debug!(parameter, hook = hook.name(), "hook chain stopped");
        }
        out
    })
}

/// Maps application-level tokens to wire tokens (or the reverse).
///
/// Keys are compared against the rendered value, so `true` and `"True"` both
/// match a `"True"` entry.
#[derive(Clone)]
pub struct LookupHook {
    name: String,
    table: HashMap<String, String>,
}

impl LookupHook {
    /// Build a lookup from `(from, to)` pairs.
    pub fn new<I, K, V>(name: impl Into<String>, table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            table: table
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The reverse mapping, used as the matching post-hook.
    pub fn inverse(&self) -> Self {
        Self {
            name: format!("{}(inverse)", self.name),
            table: self
                .table
                .iter()
                .map(|(k, v)| (v.clone(), k.clone()))
                .collect(),
        }
    }

    /// Number of entries in the table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// True if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl fmt::Debug for LookupHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupHook")
            .field("name", &self.name)
            .field("entries", &self.table.len())
            .finish()
    }
}

impl Transform for LookupHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: ParameterValue) -> Option<ParameterValue> {
        let key = value.to_string();
        match self.table.get(key.trim()) {
            Some(mapped) => Some(ParameterValue::String(mapped.clone())),
            None => {
                let mut known: Vec<&str> = self.table.keys().map(String::as_str).collect();
                known.sort_unstable();
                warn!(
                    "Lookup '{}' has no entry for '{}' (known: {})",
                    self.name,
                    key,
                    known.join(", ")
                );
                None
            }
        }
    }
}

/// Adapts a closure into a named transform.
pub struct FnHook<F> {
    name: String,
    func: F,
}

impl<F> FnHook<F>
where
    F: Fn(ParameterValue) -> Option<ParameterValue> + Send + Sync,
{
    /// Wrap `func` under `name`.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Transform for FnHook<F>
where
    F: Fn(ParameterValue) -> Option<ParameterValue> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, value: ParameterValue) -> Option<ParameterValue> {
        (self.func)(value)
    }
}

/// Passes numeric values inside `[min, max]` through unchanged, vetoes the rest.
#[derive(Debug, Clone)]
pub struct RangeHook {
    min: f64,
    max: f64,
}

impl RangeHook {
    /// Inclusive range check.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Transform for RangeHook {
    fn name(&self) -> &str {
        "range"
    }

    fn apply(&self, value: ParameterValue) -> Option<ParameterValue> {
        match value.as_f64() {
            Some(v) if v >= self.min && v <= self.max => Some(value),
            Some(v) => {
                warn!("Value {} outside allowed range [{}, {}]", v, self.min, self.max);
                None
            }
            None => {
                warn!("Range check needs a number, got '{}'", value);
                None
            }
        }
    }
}

/// Linear conversion `value * factor + offset`, always producing a float.
#[derive(Debug, Clone)]
pub struct ScaleHook {
    factor: f64,
    offset: f64,
}

impl ScaleHook {
    /// Multiply by `factor`.
    pub fn new(factor: f64) -> Self {
        Self {
            factor,
            offset: 0.0,
        }
    }

    /// Add `offset` after scaling.
    pub fn with_offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }
}

impl Transform for ScaleHook {
    fn name(&self) -> &str {
        "scale"
    }

    fn apply(&self, value: ParameterValue) -> Option<ParameterValue> {
        match value.as_f64() {
            Some(v) => Some(ParameterValue::Float(v * self.factor + self.offset)),
            None => {
                warn!("Cannot scale non-numeric value '{}'", value);
                None
            }
        }
    }
}

/// Parses a textual reply into a float.
#[derive(Debug, Clone, Default)]
pub struct ParseFloatHook;

impl Transform for ParseFloatHook {
    fn name(&self) -> &str {
        "parse_float"
    }

    fn apply(&self, value: ParameterValue) -> Option<ParameterValue> {
        let parsed = value.as_f64().map(ParameterValue::Float);
        if parsed.is_none() {
            warn!("Could not parse '{}' as a number", value);
        }
        parsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_is_identity() {
        assert_eq!(apply_chain("p", &[], 3.into()), Some(3.into()));
    }

    #[test]
    fn test_chain_runs_in_registration_order() {
        let hooks: Vec<Hook> = vec![
            Arc::new(FnHook::new("append_a", |v: ParameterValue| {
                Some(format!("{}a", v).into())
            })),
            Arc::new(FnHook::new("append_b", |v: ParameterValue| {
                Some(format!("{}b", v).into())
            })),
        ];
        assert_eq!(apply_chain("p", &hooks, "x".into()), Some("xab".into()));
    }

    #[test]
    fn test_chain_short_circuits() {
        let hooks: Vec<Hook> = vec![
            Arc::new(FnHook::new("veto", |_| None)),
            Arc::new(FnHook::new("unreachable", |_| -> Option<ParameterValue> {
                panic!("hook after a veto must not run")
            })),
        ];
        assert_eq!(apply_chain("p", &hooks, 1.into()), None);
    }

    #[test]
    fn test_lookup_round_trip() {
        let table = [("True", "ON"), ("False", "OFF")];
        let pre = LookupHook::new("enable", table);
        let post = pre.inverse();
        for (app, _) in table {
            let wire = pre.apply(app.into()).unwrap();
            assert_eq!(post.apply(wire), Some(app.into()));
        }
    }

    #[test]
    fn test_lookup_matches_rendered_bool() {
        let pre = LookupHook::new("enable", [("True", "ON"), ("False", "OFF")]);
        assert_eq!(pre.apply(true.into()), Some("ON".into()));
    }

    #[test]
    fn test_lookup_matches_whole_float() {
        let pre = LookupHook::new("gain", [("1.0", "LOW"), ("10.0", "HIGH")]);
        assert_eq!(pre.apply(1.0.into()), Some("LOW".into()));
        assert_eq!(pre.apply(ScaleHook::new(10.0).apply(1.into()).unwrap()), Some("HIGH".into()));
    }

    #[test]
    fn test_lookup_unknown_values_are_vetoed_both_ways() {
        let pre = LookupHook::new("mode", [("fast", "F"), ("slow", "S")]);
        let post = pre.inverse();
        assert_eq!(pre.apply("medium".into()), None);
        assert_eq!(post.apply("M".into()), None);
    }

    #[test]
    fn test_range_hook() {
        let hook = RangeHook::new(0.0, 10.0);
        assert_eq!(hook.apply(5.into()), Some(5.into()));
        assert_eq!(hook.apply("10".into()), Some("10".into()));
        assert_eq!(hook.apply(11.into()), None);
        assert_eq!(hook.apply("abc".into()), None);
    }

    #[test]
    fn test_scale_hook_with_offset() {
        let hook = ScaleHook::new(2.0).with_offset(1.0);
        assert_eq!(hook.apply("3".into()), Some(7.0.into()));
        assert_eq!(hook.apply(true.into()), None);
    }

    #[test]
    fn test_parse_float_hook() {
        assert_eq!(ParseFloatHook.apply(" 1.25\r".into()), Some(1.25.into()));
        assert_eq!(ParseFloatHook.apply("ERR".into()), None);
    }
}

//! Layered configuration shared by every task of one invocation
//!
//! Layers merge key by key, later layers winning: built-in defaults, the `config:`
//! section of the task file, `INVOKER_*` environment variables, then `--set` flags.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use thiserror::Error;

use crate::tasks::collection::MatchPolicy;
use crate::tasks::params::ParamKind;

/// Prefix of environment variables that override configuration
pub const ENV_PREFIX: &str = "INVOKER_";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("invalid override '{0}': expected KEY=VALUE")]
    InvalidOverride(String),
    #[error("the config section must be a mapping, got: {0}")]
    NotAMapping(String),
    #[error("invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },
}

fn defaults() -> JsonValue {
    json!({
        "tasks": {
            "dedupe": true,
            "match": "prefix",
            "continue_on_failure": false,
        },
        "run": {
            "shell": "sh",
            "echo": false,
            "hide": false,
            "warn": false,
            "env": {},
        },
    })
}

/// Recursively merge `overlay` into `base`. Mappings merge, anything else replaces.
fn merge(base: &mut JsonValue, overlay: JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base), JsonValue::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Wrap `value` in nested mappings following a dotted key.
fn nest(key: &str, value: JsonValue) -> JsonValue {
    key.rsplit('.').fold(value, |inner, segment| {
        let mut map = Map::new();
        map.insert(segment.to_string(), inner);
        JsonValue::Object(map)
    })
}

/// Parse override text as JSON when it is valid JSON, otherwise keep it as a string.
fn parse_raw(raw: &str) -> JsonValue {
    serde_json::from_str(raw).unwrap_or_else(|_| JsonValue::String(raw.to_string()))
}

/// Builds a [`Context`] layer by layer
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    values: JsonValue,
    remainder: Vec<String>,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    /// Start from the built-in defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: defaults(),
            remainder: Vec::new(),
        }
    }

    /// Merge the task file's configuration mapping.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::NotAMapping` if `value` is neither a mapping nor null.
    pub fn file(mut self, value: JsonValue) -> Result<Self, ContextError> {
        match value {
            JsonValue::Null => {}
            JsonValue::Object(_) => merge(&mut self.values, value),
            other => return Err(ContextError::NotAMapping(other.to_string())),
        }
        Ok(self)
    }

    /// Merge `INVOKER_*` variables; `INVOKER_RUN__ECHO` sets `run.echo`.
    #[must_use]
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut pairs: Vec<(String, String)> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let key = key.as_ref().strip_prefix(ENV_PREFIX)?;
                if key.is_empty() {
                    return None;
                }
                Some((
                    key.to_ascii_lowercase().replace("__", "."),
                    value.as_ref().to_string(),
                ))
            })
            .collect();
        pairs.sort();
        for (key, value) in pairs {
            debug!("Config override from environment: {key}");
            self = self.set(&key, &value);
        }
        self
    }

    /// Set one dotted key from raw text.
    #[must_use]
    pub fn set(mut self, key: &str, raw: &str) -> Self {
        merge(&mut self.values, nest(key, parse_raw(raw)));
        self
    }

    /// Apply a `KEY=VALUE` override as given on the command line.
    ///
    /// # Errors
    ///
    /// Returns `ContextError::InvalidOverride` if there is no `=` or the key is empty.
    pub fn set_override(self, assignment: &str) -> Result<Self, ContextError> {
        match assignment.split_once('=') {
            Some((key, raw)) if !key.trim().is_empty() => Ok(self.set(key.trim(), raw)),
            _ => Err(ContextError::InvalidOverride(assignment.to_string())),
        }
    }

    /// Tokens given after `--` on the command line.
    #[must_use]
    pub fn remainder(mut self, remainder: Vec<String>) -> Self {
        self.remainder = remainder;
        self
    }

    #[must_use]
    pub fn build(self) -> Context {
        Context {
            values: self.values,
            remainder: self.remainder,
        }
    }
}

/// Read-only configuration for one invocation
#[derive(Debug, Clone, Serialize)]
pub struct Context {
    values: JsonValue,
    remainder: Vec<String>,
}

impl Default for Context {
    fn default() -> Self {
        ContextBuilder::new().build()
    }
}

impl Context {
    #[must_use]
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Look up a dotted key such as `run.echo`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        key.split('.')
            .try_fold(&self.values, |value, segment| value.get(segment))
    }

    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(JsonValue::as_str)
    }

    #[must_use]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.get(key).and_then(JsonValue::as_i64)
    }

    /// Booleans also accept `0`/`1` and the textual spellings used for bool parameters.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            JsonValue::Bool(b) => Some(*b),
            JsonValue::Number(n) => n.as_i64().map(|n| n != 0),
            JsonValue::String(s) => ParamKind::Bool.coerce(s).and_then(|v| v.as_bool()),
            _ => None,
        }
    }

    /// A mapping of strings, e.g. `run.env`. Non-string scalars are rendered as text.
    #[must_use]
    pub fn get_string_map(&self, key: &str) -> HashMap<String, String> {
        self.get(key)
            .and_then(JsonValue::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| {
                        let text = match v {
                            JsonValue::String(s) => s.clone(),
                            JsonValue::Bool(_) | JsonValue::Number(_) => v.to_string(),
                            _ => return None,
                        };
                        Some((k.clone(), text))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Tokens given after `--` on the command line
    #[must_use]
    pub fn remainder(&self) -> &[String] {
        &self.remainder
    }

    /// # Errors
    ///
    /// Returns `ContextError::InvalidValue` if `tasks.match` is not `exact` or `prefix`.
    pub fn match_policy(&self) -> Result<MatchPolicy, ContextError> {
        match self.get("tasks.match") {
            None => Ok(MatchPolicy::default()),
            Some(JsonValue::String(s)) => s.parse().map_err(|reason| ContextError::InvalidValue {
                key: "tasks.match".to_string(),
                reason,
            }),
            Some(other) => Err(ContextError::InvalidValue {
                key: "tasks.match".to_string(),
                reason: format!("expected a string, got {other}"),
            }),
        }
    }

    #[must_use]
    pub fn dedupe(&self) -> bool {
        self.get_bool("tasks.dedupe").unwrap_or(true)
    }

    #[must_use]
    pub fn continue_on_failure(&self) -> bool {
        self.get_bool("tasks.continue_on_failure").unwrap_or(false)
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a parameter consumes and coerces command-line text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    #[default]
    String,
    Int,
    Bool,
    Flag,
}

impl ParamKind {
    /// Whether `--name` must be followed by a value
    #[must_use]
    pub fn takes_value(self) -> bool {
        matches!(self, ParamKind::String | ParamKind::Int)
    }

    /// Coerce raw text into a value of this kind, or `None` if it doesn't fit.
    #[must_use]
    pub fn coerce(self, raw: &str) -> Option<Value> {
        match self {
            ParamKind::String => Some(Value::Str(raw.to_string())),
            ParamKind::Int => raw.trim().parse().ok().map(Value::Int),
            ParamKind::Bool | ParamKind::Flag => parse_bool(raw).map(Value::Bool),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParamKind::String => "string",
            ParamKind::Int => "int",
            ParamKind::Bool => "bool",
            ParamKind::Flag => "flag",
        };
        f.write_str(name)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// A bound argument value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// A declared task parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<Value>,
    pub help: Option<String>,
    pub short: Option<char>,
    /// Explicit positional setting; `None` means "positional when required"
    pub positional: Option<bool>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            help: None,
            short: None,
            positional: None,
        }
    }

    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    #[must_use]
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    #[must_use]
    pub fn short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }

    #[must_use]
    pub fn positional(mut self, positional: bool) -> Self {
        self.positional = Some(positional);
        self
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.default.is_none() && self.kind != ParamKind::Flag
    }

    #[must_use]
    pub fn is_positional(&self) -> bool {
        self.kind != ParamKind::Flag && self.positional.unwrap_or_else(|| self.is_required())
    }

    /// The value used when nothing was given on the command line
    #[must_use]
    pub fn fallback(&self) -> Option<Value> {
        match (&self.default, self.kind) {
            (Some(value), _) => Some(value.clone()),
            (None, ParamKind::Flag) => Some(Value::Bool(false)),
            (None, _) => None,
        }
    }

    /// The long flag spelling, e.g. `dry_run` becomes `dry-run`
    #[must_use]
    pub fn flag_name(&self) -> String {
        normalize(&self.name)
    }
}

/// Names compare with dashes and underscores treated alike.
#[must_use]
pub fn normalize(name: &str) -> String {
    name.replace('_', "-")
}

/// Arguments bound to one task invocation, in declared parameter order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Arguments {
    values: Vec<(String, Value)>,
}

impl Arguments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.values.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.values.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        let wanted = normalize(name);
        self.values
            .iter()
            .find(|(n, _)| normalize(n) == wanted)
            .map(|(_, v)| v)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl fmt::Display for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.iter().map(|(n, v)| format!("{n}={v}")).collect();
        f.write_str(&parts.join(" "))
    }
}

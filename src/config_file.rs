//! Task file handling for Invoker

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::collection::{CollectionBuilder, CollectionError};
use crate::tasks::command::CommandBody;
use crate::tasks::params::{ParamKind, Parameter, Value};
use crate::tasks::task::Task;

/// Errors that can occur while loading a task file
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("No task file found in current directory or its parents: {0}")]
    ConfigNotFound(PathBuf),
    #[error("Unable to find directory: {path:?} (entry: {entry:?})")]
    DirectoryNotFound {
        entry: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown working directory: {0}")]
    UnknownWorkingDirectory(String),
    #[error("Unable to parse YAML task file {path}: {source}")]
    Yaml {
        source: serde_yaml::Error,
        path: PathBuf,
    },
    #[error("Unable to parse JSON task file {path}: {source}")]
    Json {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("Invalid parameter '{param}' of '{entry}': {reason}")]
    Parameter {
        entry: String,
        param: String,
        reason: String,
    },
    #[error("Invalid entry '{entry}': {source}")]
    Collection {
        entry: String,
        #[source]
        source: CollectionError,
    },
}

/// A declared parameter
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConfigParam {
    pub name: String,
    pub kind: Option<ParamKind>,
    pub default: Option<Value>,
    pub help: Option<String>,
    pub short: Option<char>,
    pub positional: Option<bool>,
}

impl ConfigParam {
    fn into_parameter(self, entry: &str) -> Result<Parameter, ConfigError> {
        let kind = self.kind.unwrap_or_default();
        let invalid = |reason: String| ConfigError::Parameter {
            entry: entry.to_string(),
            param: self.name.clone(),
            reason,
        };
        let default = match (kind, self.default.clone()) {
            (_, None) => None,
            (ParamKind::String, Some(Value::Str(s))) => Some(Value::Str(s)),
            (ParamKind::String, Some(other)) => Some(Value::Str(other.to_string())),
            (ParamKind::Int, Some(Value::Int(i))) => Some(Value::Int(i)),
            (ParamKind::Bool | ParamKind::Flag, Some(Value::Bool(b))) => Some(Value::Bool(b)),
            (kind, Some(other)) => {
                return Err(invalid(format!("default '{other}' is not a valid {kind}")));
            }
        };
        if kind == ParamKind::Flag && self.positional == Some(true) {
            return Err(invalid("flags cannot be positional".to_string()));
        }
        Ok(Parameter {
            name: self.name,
            kind,
            default,
            help: self.help,
            short: self.short,
            positional: self.positional,
        })
    }
}

/// Configuration for a single task
#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigTask {
    pub name: String,
    pub help: Option<String>,
    pub cmd: String,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub params: Option<Vec<ConfigParam>>,
    pub pre: Option<Vec<String>>,
    pub post: Option<Vec<String>>,
    pub aliases: Option<Vec<String>>,
}

/// Contents shared by the root and nested collections
#[derive(Debug, Deserialize, Serialize, Default)]
pub struct ConfigNamespace {
    pub help: Option<String>,
    pub default: Option<String>,
    pub cwd: Option<PathBuf>,
    pub env: Option<HashMap<String, String>>,
    pub tasks: Option<Vec<ConfigTask>>,
    pub collections: Option<Vec<ConfigCollection>>,
}

/// Configuration for a nested collection
#[derive(Debug, Deserialize, Serialize)]
pub struct ConfigCollection {
    pub name: String,
    #[serde(flatten)]
    pub namespace: ConfigNamespace,
}

/// Root structure of a task file
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub invoker_version: String,
    /// Project configuration layer for the task context
    pub config: Option<serde_json::Value>,
    #[serde(flatten)]
    pub root: ConfigNamespace,
}

/// Resolve `child` against `parent`: empty means the parent, relative paths are joined.
#[must_use]
pub fn inherit_path(parent: &Path, child: PathBuf) -> PathBuf {
    if child.as_os_str().is_empty() {
        parent.to_path_buf()
    } else if child.is_relative() {
        parent.join(child)
    } else {
        child
    }
}

fn entry_path(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

/// Working directory and environment handed down from enclosing collections
struct Inherited {
    cwd: PathBuf,
    env: HashMap<String, String>,
}

impl Inherited {
    fn child(&self, entry: &str, cwd: Option<PathBuf>, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let cwd = inherit_path(&self.cwd, cwd.unwrap_or_default());
        let cwd = cwd
            .canonicalize()
            .map_err(|e| ConfigError::DirectoryNotFound {
                entry: entry.to_string(),
                path: cwd.clone(),
                source: e,
            })?;
        let mut merged = self.env.clone();
        merged.extend(env.unwrap_or_default());
        Ok(Self { cwd, env: merged })
    }
}

impl ConfigTask {
    fn into_task(self, scope: &str, inherited: &Inherited) -> Result<Task, ConfigError> {
        let entry = entry_path(scope, &self.name);
        let own = inherited.child(&entry, self.cwd, self.env)?;
        let params = self
            .params
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.into_parameter(&entry))
            .collect::<Result<Vec<Parameter>, ConfigError>>()?;

        let flags = params
            .iter()
            .filter(|p| p.kind == ParamKind::Flag)
            .map(Parameter::flag_name)
            .collect();
        let mut task = Task::new(CommandBody {
            cmd: self.cmd,
            cwd: own.cwd,
            env: own.env,
            flags,
        });
        task.help = self.help;
        task.params = params;
        task.pre = self.pre.unwrap_or_default();
        task.post = self.post.unwrap_or_default();
        task.aliases = self.aliases.unwrap_or_default();
        Ok(task)
    }
}

impl ConfigNamespace {
    fn into_builder(self, scope: &str, inherited: &Inherited) -> Result<CollectionBuilder, ConfigError> {
        let own = inherited.child(if scope.is_empty() { "<root>" } else { scope }, self.cwd, self.env)?;
        let mut builder = CollectionBuilder::new();
        if let Some(help) = self.help {
            builder = builder.help(help);
        }

        for task in self.tasks.unwrap_or_default() {
            let name = task.name.clone();
            let entry = entry_path(scope, &name);
            let task = task.into_task(scope, &own)?;
            builder
                .register(name, task)
                .map_err(|source| ConfigError::Collection { entry, source })?;
        }
        for collection in self.collections.unwrap_or_default() {
            let entry = entry_path(scope, &collection.name);
            let child = collection.namespace.into_builder(&entry, &own)?;
            builder
                .register(collection.name, child)
                .map_err(|source| ConfigError::Collection { entry, source })?;
        }
        if let Some(default) = self.default {
            builder.set_default(default);
        }
        Ok(builder)
    }

    /// Convert into a collection builder; paths resolve against `base`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for invalid parameters, duplicate names or missing directories.
    pub fn to_builder(self, base: &Path) -> Result<CollectionBuilder, ConfigError> {
        let inherited = Inherited {
            cwd: base.to_path_buf(),
            env: HashMap::new(),
        };
        self.into_builder("", &inherited)
    }
}

/// List of supported task file names
const FILENAMES: [&str; 3] = [".invoker.json", ".invoker.yaml", ".invoker.yml"];

impl Config {
    /// Loads and parses a task file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if the file cannot be read, or
    /// `ConfigError::Yaml`/`ConfigError::Json` if parsing fails.
    pub fn from_file(file: &Path) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(file)
            .map_err(|_| ConfigError::ConfigNotFound(file.to_path_buf()))?;
        let config: Config = if file.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&contents).map_err(|e| ConfigError::Json {
                source: e,
                path: file.to_path_buf(),
            })?
        } else {
            serde_yaml::from_str(&contents).map_err(|e| ConfigError::Yaml {
                source: e,
                path: file.to_path_buf(),
            })?
        };
        Ok(config)
    }

    /// Searches for a task file in the current directory and its parents.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownWorkingDirectory` if the cwd cannot be determined,
    /// or `ConfigError::ConfigNotFound` if no task file is found.
    pub fn find_config() -> Result<PathBuf, ConfigError> {
        let cwd = std::env::current_dir()
            .map_err(|e| ConfigError::UnknownWorkingDirectory(e.to_string()))?;
        Self::find_config_from(&cwd)
    }

    /// Searches for a task file in `start` and its parents.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ConfigNotFound` if no task file is found.
    pub fn find_config_from(start: &Path) -> Result<PathBuf, ConfigError> {
        let mut path = start.to_path_buf();
        debug!("Searching for task file in {}", start.display());
        loop {
            for file in &FILENAMES {
                let config_path = path.join(file);
                if config_path.exists() {
                    info!("Found task file: {}", config_path.display());
                    return Ok(config_path);
                }
            }
            if !path.pop() {
                return Err(ConfigError::ConfigNotFound(start.to_path_buf()));
            }
        }
    }
}

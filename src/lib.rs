//! Core implementation of the Invoker task runner
//!
//! Tasks are organised in a tree of named collections. A command line such as
//! `inv build test --verbose deploy` is resolved against that tree into an ordered
//! plan (pre-tasks, the task itself, post-tasks), which the executor then runs
//! one task at a time against a layered configuration context.

use std::path::PathBuf;

use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::config_file::{Config, ConfigError};
use crate::tasks::collection::Collection;

pub mod config_file;
pub mod context;
pub mod executor;
pub mod listing;
pub mod logger;
pub mod report;
pub mod resolver;
pub mod tasks;

/// A loaded task file
#[derive(Debug)]
pub struct Project {
    /// Root of the namespace tree
    pub root: Collection,
    /// The file's `config` section, the project layer of the context
    pub config: JsonValue,
    /// Directory holding the task file
    pub cwd: PathBuf,
    /// The task file itself
    pub path: PathBuf,
}

/// Load a task file (or auto-detect one), freezing its tree into a `Collection`.
///
/// # Errors
///
/// Returns `ConfigError` if the task file is not found, cannot be parsed,
/// contains invalid entries, or references non-existent directories.
pub fn load_config(config_file: Option<&str>) -> Result<Project, ConfigError> {
    let config_path = match config_file {
        Some(file) => {
            let config_path = PathBuf::from(file);
            if !config_path.exists() {
                return Err(ConfigError::ConfigNotFound(config_path));
            }
            config_path
        }
        None => Config::find_config()?,
    };
    let cwd = match config_path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => PathBuf::from("."),
        Some(parent) => parent.to_path_buf(),
        None => return Err(ConfigError::ConfigNotFound(config_path)),
    };
    debug!(
        "Loading tasks from {} (cwd: {})",
        config_path.display(),
        cwd.display()
    );
    let parsed = Config::from_file(&config_path)?;
    validate_version(&parsed.invoker_version);

    let root = parsed
        .root
        .to_builder(&cwd)?
        .build()
        .map_err(|source| ConfigError::Collection {
            entry: config_path.display().to_string(),
            source,
        })?;
    debug!("Loaded {} tasks", root.tasks().len());

    Ok(Project {
        root,
        config: parsed.config.unwrap_or(JsonValue::Null),
        cwd,
        path: config_path,
    })
}

/// Warn if the file's `invoker_version` doesn't match the binary version
fn validate_version(config_version: &str) {
    let binary_version = env!("CARGO_PKG_VERSION");
    if config_version != binary_version {
        warn!(
            "Task file invoker_version '{config_version}' differs from binary version '{binary_version}'"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::collection::CollectionError;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_load_nested_collections() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            &dir,
            ".invoker.yaml",
            r"
invoker_version: '0.1.0'
default: build
tasks:
  - name: build
    cmd: echo build
    pre: [clean]
  - name: clean
    cmd: echo clean
collections:
  - name: db
    default: migrate
    tasks:
      - name: migrate
        cmd: echo migrate
",
        );
        let project = load_config(Some(&file)).unwrap();
        let paths: Vec<String> = project.root.tasks().into_iter().map(|t| t.path).collect();
        assert_eq!(paths, vec!["build", "clean", "db.migrate"]);
        assert_eq!(project.root.default_task().unwrap().path, "build");
        assert_eq!(project.config, JsonValue::Null);
    }

    #[test]
    fn test_missing_file() {
        let result = load_config(Some("/nonexistent/.invoker.yaml"));
        assert!(matches!(result, Err(ConfigError::ConfigNotFound(_))));
    }

    #[test]
    fn test_unknown_reference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            &dir,
            ".invoker.json",
            r#"{"invoker_version": "0.1.0", "tasks": [{"name": "a", "cmd": "true", "pre": ["ghost"]}]}"#,
        );
        match load_config(Some(&file)) {
            Err(ConfigError::Collection {
                source: CollectionError::UnknownReference { reference, .. },
                ..
            }) => assert_eq!(reference, "ghost"),
            other => panic!("Expected UnknownReference, got: {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            &dir,
            ".invoker.yaml",
            "invoker_version: '0.1.0'\ntasks:\n  - name: a\n    cmd: 'true'\n  - name: a\n    cmd: 'false'\n",
        );
        assert!(matches!(
            load_config(Some(&file)),
            Err(ConfigError::Collection {
                source: CollectionError::DuplicateName(_),
                ..
            })
        ));
    }

    #[test]
    fn test_missing_cwd_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = write(
            &dir,
            ".invoker.yaml",
            "invoker_version: '0.1.0'\ntasks:\n  - name: a\n    cmd: 'true'\n    cwd: nope\n",
        );
        assert!(matches!(
            load_config(Some(&file)),
            Err(ConfigError::DirectoryNotFound { .. })
        ));
    }
}

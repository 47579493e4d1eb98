use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::context::Context;
use crate::tasks::params::{Arguments, Parameter};

/// Output captured from a task body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A task body signalling failure.
#[derive(Error, Debug, Clone, Default)]
#[error("{message}")]
pub struct TaskFailure {
    pub message: String,
    pub exit_code: Option<i32>,
    pub output: TaskOutput,
}

impl TaskFailure {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// The executable part of a task.
pub trait TaskBody: Send + Sync {
    /// Run the body with the shared context and this task's bound arguments.
    ///
    /// # Errors
    ///
    /// Returns `TaskFailure` when the work did not succeed.
    fn call(&self, ctx: &Context, args: &Arguments) -> Result<TaskOutput, TaskFailure>;
}

impl<F> TaskBody for F
where
    F: Fn(&Context, &Arguments) -> Result<TaskOutput, TaskFailure> + Send + Sync,
{
    fn call(&self, ctx: &Context, args: &Arguments) -> Result<TaskOutput, TaskFailure> {
        self(ctx, args)
    }
}

/// A named, parameterized unit of work. The name lives in the owning collection.
#[derive(Clone)]
pub struct Task {
    pub help: Option<String>,
    pub params: Vec<Parameter>,
    /// References to tasks that must run before this one
    pub pre: Vec<String>,
    /// References to tasks planned right after this one
    pub post: Vec<String>,
    pub aliases: Vec<String>,
    body: Arc<dyn TaskBody>,
}

impl Task {
    pub fn new(body: impl TaskBody + 'static) -> Self {
        Self {
            help: None,
            params: Vec::new(),
            pre: Vec::new(),
            post: Vec::new(),
            aliases: Vec::new(),
            body: Arc::new(body),
        }
    }

    /// Build a task from a closure body.
    pub fn from_fn<F>(body: F) -> Self
    where
        F: Fn(&Context, &Arguments) -> Result<TaskOutput, TaskFailure> + Send + Sync + 'static,
    {
        Self::new(body)
    }

    /// A task whose body always succeeds without output.
    #[must_use]
    pub fn noop() -> Self {
        Self::from_fn(|_, _| Ok(TaskOutput::default()))
    }

    #[must_use]
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    #[must_use]
    pub fn param(mut self, param: Parameter) -> Self {
        self.params.push(param);
        self
    }

    #[must_use]
    pub fn pre(mut self, reference: impl Into<String>) -> Self {
        self.pre.push(reference.into());
        self
    }

    #[must_use]
    pub fn post(mut self, reference: impl Into<String>) -> Self {
        self.post.push(reference.into());
        self
    }

    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    #[must_use]
    pub fn body(&self) -> &dyn TaskBody {
        self.body.as_ref()
    }

    /// Parameters that accept bare (positional) values, in declared order.
    pub fn positional_params(&self) -> impl Iterator<Item = &Parameter> {
        self.params.iter().filter(|p| p.is_positional())
    }

    /// Short flag letters: explicit ones, plus the first letter of any parameter
    /// whose initial is shared with no other parameter.
    #[must_use]
    pub fn short_flags(&self) -> Vec<(char, &Parameter)> {
        let explicit: Vec<char> = self.params.iter().filter_map(|p| p.short).collect();
        self.params
            .iter()
            .filter_map(|p| {
                if let Some(short) = p.short {
                    return Some((short, p));
                }
                let initial = p.name.chars().next()?;
                let shared = self
                    .params
                    .iter()
                    .filter(|other| other.name.chars().next() == Some(initial))
                    .count()
                    > 1;
                (!shared && !explicit.contains(&initial)).then_some((initial, p))
            })
            .collect()
    }

    #[must_use]
    pub fn describe(&self) -> TaskInfo {
        TaskInfo {
            help: self.help.clone(),
            aliases: self.aliases.clone(),
            params: self.params.iter().map(|p| p.name.clone()).collect(),
            pre: self.pre.clone(),
            post: self.post.clone(),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("help", &self.help)
            .field("params", &self.params)
            .field("pre", &self.pre)
            .field("post", &self.post)
            .field("aliases", &self.aliases)
            .finish_non_exhaustive()
    }
}

/// Serializable description of a task, used by listings.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pre: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub post: Vec<String>,
}

//! Turns command-line tokens into an ordered invocation plan
//!
//! Resolution happens entirely up front: every task name is looked up and every argument
//! bound before anything runs, so a malformed invocation never has partial side effects.

use std::fmt;
use std::sync::Arc;

use log::debug;
use thiserror::Error;
use uuid::Uuid;

use crate::context::{Context, ContextError};
use crate::tasks::collection::{Collection, LookupError, MatchPolicy, TaskRef};
use crate::tasks::params::{Arguments, ParamKind, Parameter, Value, normalize};
use crate::tasks::task::Task;

/// Errors raised before any task runs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("{task}: unknown argument '{argument}'")]
    UnknownArgument { task: String, argument: String },
    #[error("{task}: missing value for required argument '{param}'")]
    MissingArgument { task: String, param: String },
    #[error("{task}: '{value}' is not a valid {kind} for '{param}'")]
    ArgumentType {
        task: String,
        param: String,
        value: String,
        kind: ParamKind,
    },
}

/// Why an entry is in the plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Named on the command line
    Requested,
    /// Pulled in as a pre-requisite
    Pre,
    /// Pulled in as a post-task
    Post,
}

/// One task execution in a plan
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub path: String,
    pub task: Arc<Task>,
    pub args: Arguments,
    pub origin: Origin,
}

impl fmt::Display for PlannedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            f.write_str(&self.path)
        } else {
            write!(f, "{} ({})", self.path, self.args)
        }
    }
}

/// Ordered, validated sequence of task executions for one invocation
#[derive(Debug, Clone)]
pub struct InvocationPlan {
    pub id: Uuid,
    pub entries: Vec<PlannedTask>,
    /// Tokens after `--`
    pub remainder: Vec<String>,
}

impl InvocationPlan {
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Knobs taken from the `tasks.*` configuration keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverOptions {
    pub match_policy: MatchPolicy,
    pub dedupe: bool,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            match_policy: MatchPolicy::UniquePrefix,
            dedupe: true,
        }
    }
}

impl ResolverOptions {
    /// # Errors
    ///
    /// Returns `ContextError::InvalidValue` if `tasks.match` is malformed.
    pub fn from_context(ctx: &Context) -> Result<Self, ContextError> {
        Ok(Self {
            match_policy: ctx.match_policy()?,
            dedupe: ctx.dedupe(),
        })
    }
}

/// Split tokens at the first literal `--`.
#[must_use]
pub fn split_remainder<S: AsRef<str>>(tokens: &[S]) -> (&[S], &[S]) {
    match tokens.iter().position(|t| t.as_ref() == "--") {
        Some(pos) => (&tokens[..pos], &tokens[pos + 1..]),
        None => (tokens, &[]),
    }
}

/// `-x`, `--name`; a lone `-` or a negative number is a value
fn is_flag_token(token: &str) -> bool {
    token.len() > 1
        && token.starts_with('-')
        && !token[1..].starts_with(|c: char| c.is_ascii_digit())
}

/// Resolves invocations against a frozen root collection
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    root: &'a Collection,
    options: ResolverOptions,
}

impl<'a> Resolver<'a> {
    #[must_use]
    pub fn new(root: &'a Collection) -> Self {
        Self {
            root,
            options: ResolverOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ResolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve a token list into a plan.
    ///
    /// # Errors
    ///
    /// Returns `ResolveError` for unknown, ambiguous or default-less task names and for
    /// arguments that cannot be bound. Nothing is planned when an error is returned.
    pub fn resolve<S: AsRef<str>>(&self, tokens: &[S]) -> Result<InvocationPlan, ResolveError> {
        let (tokens, remainder) = split_remainder(tokens);
        let tokens: Vec<&str> = tokens.iter().map(AsRef::as_ref).collect();

        let mut requests: Vec<(TaskRef, Arguments)> = Vec::new();
        let mut i = 0;
        loop {
            // A leading flag (or no tokens at all) targets the root default task
            let (name, start) = match tokens.get(i) {
                Some(token) if requests.is_empty() && is_flag_token(token) => ("", i),
                Some(token) => (*token, i + 1),
                None if requests.is_empty() => ("", i),
                None => break,
            };
            let task_ref = self.root.resolve_task(name, self.options.match_policy)?;
            let (args, next) = bind(&task_ref, &tokens, start)?;
            debug!("Resolved '{name}' to {} ({args})", task_ref.path);
            requests.push((task_ref, args));
            i = next;
        }

        let mut entries = Vec::new();
        for (task_ref, args) in requests {
            let already = self.options.dedupe
                && entries
                    .iter()
                    .any(|e: &PlannedTask| e.path == task_ref.path && e.args == args);
            if already {
                debug!("Skipping repeated request for {}", task_ref.path);
                continue;
            }
            self.plan(task_ref, args, Origin::Requested, &mut entries, &mut Vec::new())?;
        }

        let plan = InvocationPlan {
            id: Uuid::new_v4(),
            entries,
            remainder: remainder.iter().map(|t| t.as_ref().to_string()).collect(),
        };
        debug!("Invocation {} planned: {}", plan.id, plan.paths().join(", "));
        Ok(plan)
    }

    /// Plan `task_ref` with its pre-tasks before it and its post-tasks after it.
    /// `expanding` holds the paths whose expansion is still in progress.
    fn plan(
        &self,
        task_ref: TaskRef,
        args: Arguments,
        origin: Origin,
        entries: &mut Vec<PlannedTask>,
        expanding: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        expanding.push(task_ref.path.clone());
        for pre in &task_ref.task.pre {
            self.plan_reference(pre, Origin::Pre, entries, expanding)?;
        }
        let post = task_ref.task.post.clone();
        entries.push(PlannedTask {
            path: task_ref.path,
            task: task_ref.task,
            args,
            origin,
        });
        for reference in &post {
            self.plan_reference(reference, Origin::Post, entries, expanding)?;
        }
        expanding.pop();
        Ok(())
    }

    /// Plan a pre/post reference with its default arguments.
    fn plan_reference(
        &self,
        path: &str,
        origin: Origin,
        entries: &mut Vec<PlannedTask>,
        expanding: &mut Vec<String>,
    ) -> Result<(), ResolveError> {
        // A post-task leading back to a task still being expanded
        if expanding.iter().any(|p| p == path) {
            debug!("{path} is already being planned");
            return Ok(());
        }
        if self.options.dedupe && entries.iter().any(|e| e.path == path) {
            return Ok(());
        }
        let task_ref = self.root.resolve_task(path, MatchPolicy::Exact)?;
        let (args, _) = bind(&task_ref, &[], 0)?;
        self.plan(task_ref, args, origin, entries, expanding)
    }
}

fn find_long<'t>(task: &'t Task, flag: &str) -> Option<&'t Parameter> {
    let wanted = normalize(flag);
    task.params.iter().find(|p| p.flag_name() == wanted)
}

/// Bind the tokens following a task name, starting at `start`.
/// Returns the arguments and the index of the first token not consumed.
fn bind(task_ref: &TaskRef, tokens: &[&str], start: usize) -> Result<(Arguments, usize), ResolveError> {
    let task = task_ref.task.as_ref();
    let unknown = |argument: &str| ResolveError::UnknownArgument {
        task: task_ref.path.clone(),
        argument: argument.to_string(),
    };
    let coerce = |param: &Parameter, raw: &str| {
        param.kind.coerce(raw).ok_or_else(|| ResolveError::ArgumentType {
            task: task_ref.path.clone(),
            param: param.name.clone(),
            value: raw.to_string(),
            kind: param.kind,
        })
    };

    let shorts = task.short_flags();
    let mut bound = Arguments::new();
    let mut positionals: Vec<&str> = Vec::new();
    let mut i = start;

    while let Some(&token) = tokens.get(i) {
        i += 1;
        if !is_flag_token(token) {
            let open_slots = task
                .positional_params()
                .filter(|p| bound.get(&p.name).is_none())
                .count();
            if open_slots > positionals.len() {
                positionals.push(token);
                continue;
            }
            i -= 1;
            break;
        }

        let (spelled, inline) = match token.split_once('=') {
            Some((flag, value)) => (flag, Some(value)),
            None => (token, None),
        };
        let (param, negated) = if let Some(long) = spelled.strip_prefix("--") {
            match find_long(task, long) {
                Some(param) => (param, false),
                None => {
                    let param = long
                        .strip_prefix("no-")
                        .and_then(|rest| find_long(task, rest))
                        .filter(|p| matches!(p.kind, ParamKind::Flag | ParamKind::Bool))
                        .ok_or_else(|| unknown(token))?;
                    (param, true)
                }
            }
        } else {
            let mut chars = spelled[1..].chars();
            let letter = match (chars.next(), chars.next()) {
                (Some(letter), None) => letter,
                _ => return Err(unknown(token)),
            };
            let param = shorts
                .iter()
                .find(|(short, _)| *short == letter)
                .map(|(_, p)| *p)
                .ok_or_else(|| unknown(token))?;
            (param, false)
        };

        let value = match (inline, negated) {
            (Some(_), true) => return Err(unknown(token)),
            (Some(_), false) if param.kind == ParamKind::Flag => return Err(unknown(token)),
            (Some(raw), false) => coerce(param, raw)?,
            (None, negated) if !param.kind.takes_value() => Value::Bool(!negated),
            (None, _) => {
                let raw = tokens.get(i).ok_or_else(|| ResolveError::MissingArgument {
                    task: task_ref.path.clone(),
                    param: param.name.clone(),
                })?;
                i += 1;
                coerce(param, raw)?
            }
        };
        bound.insert(param.name.clone(), value);
    }

    let open: Vec<&Parameter> = task
        .positional_params()
        .filter(|p| bound.get(&p.name).is_none())
        .collect();
    if positionals.len() > open.len() {
        return Err(unknown(positionals[open.len()]));
    }
    for (param, raw) in open.into_iter().zip(positionals) {
        let value = coerce(param, raw)?;
        bound.insert(param.name.clone(), value);
    }

    let mut args = Arguments::new();
    for param in &task.params {
        let value = bound
            .get(&param.name)
            .cloned()
            .or_else(|| param.fallback())
            .ok_or_else(|| ResolveError::MissingArgument {
                task: task_ref.path.clone(),
                param: param.name.clone(),
            })?;
        args.insert(param.name.clone(), value);
    }
    Ok((args, i))
}

//! Rendering of the namespace tree for `--list`

use std::fmt::Write as _;
use std::str::FromStr;

use serde::Serialize;

use crate::tasks::collection::{Collection, Node, TaskRef};
use crate::tasks::task::TaskInfo;

/// Output layout for `--list`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListFormat {
    /// One dotted path per line
    #[default]
    Flat,
    /// Indented tree
    Nested,
    /// Machine-readable tree
    Json,
}

impl FromStr for ListFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flat" => Ok(ListFormat::Flat),
            "nested" => Ok(ListFormat::Nested),
            "json" => Ok(ListFormat::Json),
            other => Err(format!(
                "unknown list format '{other}' (expected flat, nested or json)"
            )),
        }
    }
}

#[derive(Serialize)]
struct CollectionListing {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    help: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    default: Option<String>,
    tasks: Vec<TaskListing>,
    collections: Vec<CollectionListing>,
}

#[derive(Serialize)]
struct TaskListing {
    name: String,
    path: String,
    #[serde(flatten)]
    info: TaskInfo,
}

impl From<&Collection> for CollectionListing {
    fn from(collection: &Collection) -> Self {
        let mut tasks = Vec::new();
        let mut collections = Vec::new();
        for (name, node) in collection.entries() {
            match node {
                Node::Task(task) => tasks.push(TaskListing {
                    name: name.to_string(),
                    path: qualify(collection.path(), name),
                    info: task.describe(),
                }),
                Node::Collection(child) => collections.push(CollectionListing::from(child)),
            }
        }
        CollectionListing {
            name: collection
                .path()
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_string(),
            help: collection.help().map(String::from),
            default: collection.default_name().map(String::from),
            tasks,
            collections,
        }
    }
}

fn qualify(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

/// Render `collection` (the root, or any sub-collection) in the given format.
///
/// # Errors
///
/// Returns `serde_json::Error` if JSON serialization fails.
pub fn render(collection: &Collection, format: ListFormat) -> Result<String, serde_json::Error> {
    match format {
        ListFormat::Flat => Ok(render_flat(collection)),
        ListFormat::Nested => Ok(render_nested(collection)),
        ListFormat::Json => {
            let mut json = serde_json::to_string_pretty(&CollectionListing::from(collection))?;
            json.push('\n');
            Ok(json)
        }
    }
}

/// Label of a task in the flat listing: its path plus every other name that reaches it.
fn flat_label(task_ref: &TaskRef, defaults: &[(String, String)]) -> String {
    let scope = task_ref.scope();
    let mut names: Vec<String> = defaults
        .iter()
        .filter(|(collection, task)| !collection.is_empty() && *task == task_ref.path)
        .map(|(collection, _)| collection.clone())
        .collect();
    names.extend(task_ref.task.aliases.iter().map(|a| qualify(scope, a)));
    if names.is_empty() {
        task_ref.path.clone()
    } else {
        format!("{} ({})", task_ref.path, names.join(", "))
    }
}

fn collect_defaults(collection: &Collection, out: &mut Vec<(String, String)>) {
    if let Some(default) = collection.default_task() {
        out.push((collection.path().to_string(), default.path));
    }
    for (_, node) in collection.entries() {
        if let Node::Collection(child) = node {
            collect_defaults(child, out);
        }
    }
}

fn render_flat(collection: &Collection) -> String {
    let mut defaults = Vec::new();
    collect_defaults(collection, &mut defaults);

    let tasks = collection.tasks();
    let rows: Vec<(String, Option<&str>)> = tasks
        .iter()
        .map(|t| (flat_label(t, &defaults), t.task.help.as_deref()))
        .collect();

    let mut out = String::from("Available tasks:\n\n");
    write_rows(&mut out, &rows);
    if let Some(default) = collection.default_task() {
        let _ = write!(out, "\nDefault task: {}\n", default.path);
    }
    out
}

fn write_rows(out: &mut String, rows: &[(String, Option<&str>)]) {
    let width = rows.iter().map(|(label, _)| label.len()).max().unwrap_or(0);
    for (label, help) in rows {
        match help {
            Some(help) => {
                let _ = writeln!(out, "  {label:<width$}  {help}");
            }
            None => {
                let _ = writeln!(out, "  {label}");
            }
        }
    }
}

fn nested_rows<'a>(collection: &'a Collection, depth: usize, rows: &mut Vec<(String, Option<&'a str>)>) {
    let indent = "  ".repeat(depth);
    for (name, node) in collection.entries() {
        match node {
            Node::Task(task) => {
                let mut label = format!("{indent}{name}");
                if !task.aliases.is_empty() {
                    let _ = write!(label, " ({})", task.aliases.join(", "));
                }
                if collection.default_name() == Some(name) {
                    label.push_str(" *");
                }
                rows.push((label, task.help.as_deref()));
            }
            Node::Collection(child) => {
                rows.push((format!("{indent}{name}."), child.help()));
                nested_rows(child, depth + 1, rows);
            }
        }
    }
}

fn render_nested(collection: &Collection) -> String {
    let mut rows = Vec::new();
    nested_rows(collection, 0, &mut rows);
    let mut out = String::from("Available tasks:\n\n");
    write_rows(&mut out, &rows);
    if rows.iter().any(|(label, _)| label.ends_with(" *")) {
        out.push_str("\n* default task of its collection\n");
    }
    out
}

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::tasks::params::normalize;
use crate::tasks::task::Task;

/// Errors raised while registering tasks or freezing a collection tree
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("'{0}' is already registered in this collection")]
    DuplicateName(String),
    #[error("invalid name '{0}': names must be non-empty and must not contain '.'")]
    InvalidName(String),
    #[error("default '{name}' of {} is not a task in that collection", scope_label(.scope))]
    InvalidDefault { scope: String, name: String },
    #[error("task '{task}' references unknown task '{reference}'")]
    UnknownReference { task: String, reference: String },
    #[error("circular pre-task chain: {0}")]
    Cycle(String),
}

/// Errors raised while looking up a dotted path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    #[error("no task or collection named '{0}'")]
    NotFound(String),
    #[error("'{segment}' is ambiguous, it could be any of: {}", .candidates.join(", "))]
    AmbiguousName {
        segment: String,
        candidates: Vec<String>,
    },
    #[error("{} has no default task", scope_label(.0))]
    NoDefaultTask(String),
}

fn scope_label(path: &str) -> String {
    if path.is_empty() {
        "the root collection".to_string()
    } else {
        format!("collection '{path}'")
    }
}

fn join_path(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}

/// How path segments are matched against registered names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Names (or aliases) must match exactly
    Exact,
    /// Exact match first, then a prefix shared by exactly one sibling
    #[default]
    UniquePrefix,
}

impl FromStr for MatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchPolicy::Exact),
            "prefix" => Ok(MatchPolicy::UniquePrefix),
            other => Err(format!(
                "unknown match policy '{other}' (expected 'exact' or 'prefix')"
            )),
        }
    }
}

/// Something that can be registered under a name
#[derive(Debug)]
pub enum Entry {
    Task(Task),
    Collection(CollectionBuilder),
}

impl From<Task> for Entry {
    fn from(task: Task) -> Self {
        Entry::Task(task)
    }
}

impl From<CollectionBuilder> for Entry {
    fn from(collection: CollectionBuilder) -> Self {
        Entry::Collection(collection)
    }
}

impl Entry {
    fn keys<'a>(&'a self, name: &'a str) -> Vec<&'a str> {
        let mut keys = vec![name];
        if let Entry::Task(task) = self {
            keys.extend(task.aliases.iter().map(String::as_str));
        }
        keys
    }
}

/// Mutable registration phase of a namespace tree
#[derive(Debug, Default)]
pub struct CollectionBuilder {
    help: Option<String>,
    entries: Vec<(String, Entry)>,
    default: Option<String>,
}

impl CollectionBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Register a task or sub-collection under `name`.
    ///
    /// # Errors
    ///
    /// Returns `CollectionError::DuplicateName` if the name, or one of a task's aliases,
    /// is already taken in this scope, and `CollectionError::InvalidName` for empty or dotted names.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        entry: impl Into<Entry>,
    ) -> Result<&mut Self, CollectionError> {
        let name = name.into();
        let entry = entry.into();

        let mut taken: HashSet<String> = self
            .entries
            .iter()
            .flat_map(|(n, e)| e.keys(n))
            .map(normalize)
            .collect();
        for key in entry.keys(&name) {
            if key.is_empty() || key.contains('.') {
                return Err(CollectionError::InvalidName(key.to_string()));
            }
            if !taken.insert(normalize(key)) {
                return Err(CollectionError::DuplicateName(key.to_string()));
            }
        }

        self.entries.push((name, entry));
        Ok(self)
    }

    /// Chaining form of [`CollectionBuilder::register`].
    ///
    /// # Errors
    ///
    /// See [`CollectionBuilder::register`].
    pub fn with(
        mut self,
        name: impl Into<String>,
        entry: impl Into<Entry>,
    ) -> Result<Self, CollectionError> {
        self.register(name, entry)?;
        Ok(self)
    }

    pub fn set_default(&mut self, name: impl Into<String>) -> &mut Self {
        self.default = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.set_default(name);
        self
    }

    /// Freeze the tree, resolving pre/post references and rejecting cycles.
    ///
    /// # Errors
    ///
    /// Returns `CollectionError` if a default is not a task of its collection,
    /// a reference cannot be resolved, or the pre-task graph has a cycle.
    pub fn build(self) -> Result<Collection, CollectionError> {
        let mut root = self.freeze(String::new())?;

        let mut resolved: HashMap<String, (Vec<String>, Vec<String>)> = HashMap::new();
        for task_ref in root.tasks() {
            let scope = task_ref.scope().to_string();
            let resolve = |references: &[String]| -> Result<Vec<String>, CollectionError> {
                references
                    .iter()
                    .map(|reference| {
                        root.resolve_reference(&scope, reference)
                            .map(|target| target.path)
                            .ok_or_else(|| CollectionError::UnknownReference {
                                task: task_ref.path.clone(),
                                reference: reference.clone(),
                            })
                    })
                    .collect()
            };
            let pre = resolve(&task_ref.task.pre)?;
            let post = resolve(&task_ref.task.post)?;
            resolved.insert(task_ref.path.clone(), (pre, post));
        }

        detect_cycles(&resolved)?;
        root.rewrite_references(&resolved);
        debug!("Froze collection tree with {} tasks", resolved.len());
        Ok(root)
    }

    fn freeze(self, path: String) -> Result<Collection, CollectionError> {
        let entries = self
            .entries
            .into_iter()
            .map(|(name, entry)| {
                let node = match entry {
                    Entry::Task(task) => Node::Task(Arc::new(task)),
                    Entry::Collection(child) => {
                        Node::Collection(child.freeze(join_path(&path, &name))?)
                    }
                };
                Ok((name, node))
            })
            .collect::<Result<Vec<_>, CollectionError>>()?;

        let default = match self.default {
            Some(default) => {
                let canonical = entries
                    .iter()
                    .find(|(name, node)| {
                        matches!(node, Node::Task(_)) && normalize(name) == normalize(&default)
                    })
                    .map(|(name, _)| name.clone())
                    .ok_or_else(|| CollectionError::InvalidDefault {
                        scope: path.clone(),
                        name: default.clone(),
                    })?;
                Some(canonical)
            }
            None => None,
        };

        Ok(Collection {
            path,
            help: self.help,
            entries,
            default,
        })
    }
}

/// Depth-first cycle check over resolved pre edges.
/// Post edges may lead back to their owner; the planner stops there.
fn detect_cycles(edges: &HashMap<String, (Vec<String>, Vec<String>)>) -> Result<(), CollectionError> {
    fn visit<'a>(
        id: &'a str,
        edges: &'a HashMap<String, (Vec<String>, Vec<String>)>,
        visited: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Result<(), CollectionError> {
        visited.insert(id);
        stack.push(id);
        if let Some((pre, _)) = edges.get(id) {
            for next in pre {
                if let Some(pos) = stack.iter().position(|s| *s == next.as_str()) {
                    let mut chain: Vec<&str> = stack[pos..].to_vec();
                    chain.push(next.as_str());
                    return Err(CollectionError::Cycle(chain.join(" -> ")));
                }
                if !visited.contains(next.as_str()) {
                    visit(next, edges, visited, stack)?;
                }
            }
        }
        stack.pop();
        Ok(())
    }

    let mut ids: Vec<&String> = edges.keys().collect();
    ids.sort();
    let mut visited = HashSet::new();
    for id in ids {
        if !visited.contains(id.as_str()) {
            visit(id, edges, &mut visited, &mut Vec::new())?;
        }
    }
    Ok(())
}

/// A frozen child of a collection
#[derive(Debug, Clone)]
pub enum Node {
    Task(Arc<Task>),
    Collection(Collection),
}

/// A task together with its dotted path from the root
#[derive(Debug, Clone)]
pub struct TaskRef {
    pub path: String,
    pub task: Arc<Task>,
}

impl TaskRef {
    /// Path of the collection owning this task
    #[must_use]
    pub fn scope(&self) -> &str {
        self.path.rsplit_once('.').map_or("", |(scope, _)| scope)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.path.rsplit_once('.').map_or(&self.path, |(_, name)| name)
    }
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct Found<'a> {
    pub node: &'a Node,
    /// Canonical dotted path, relative to the collection searched
    pub path: String,
}

/// Frozen, read-only namespace node
#[derive(Debug, Clone)]
pub struct Collection {
    path: String,
    help: Option<String>,
    entries: Vec<(String, Node)>,
    default: Option<String>,
}

impl Collection {
    #[must_use]
    pub fn builder() -> CollectionBuilder {
        CollectionBuilder::new()
    }

    /// Dotted path from the root; empty for the root itself
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    /// Name of the designated default task
    #[must_use]
    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.entries.iter().map(|(name, node)| (name.as_str(), node))
    }

    #[must_use]
    pub fn default_task(&self) -> Option<TaskRef> {
        let name = self.default.as_deref()?;
        self.entries.iter().find_map(|(n, node)| match node {
            Node::Task(task) if n == name => Some(TaskRef {
                path: join_path(&self.path, n),
                task: Arc::clone(task),
            }),
            _ => None,
        })
    }

    /// Descend the tree along a dotted path.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::NotFound` if a segment is missing, or
    /// `LookupError::AmbiguousName` if a prefix matches several siblings.
    pub fn lookup(&self, path: &str, policy: MatchPolicy) -> Result<Found<'_>, LookupError> {
        let mut current = self;
        let mut found: Option<Found<'_>> = None;
        for segment in path.split('.') {
            if let Some(Found {
                node: Node::Task(_),
                ..
            }) = found
            {
                return Err(LookupError::NotFound(path.to_string()));
            }
            let (name, node) = current
                .find_child(segment, policy)?
                .ok_or_else(|| LookupError::NotFound(path.to_string()))?;
            let canonical = match &found {
                Some(parent) => join_path(&parent.path, name),
                None => name.to_string(),
            };
            if let Node::Collection(child) = node {
                current = child;
            }
            found = Some(Found {
                node,
                path: canonical,
            });
        }
        found.ok_or_else(|| LookupError::NotFound(path.to_string()))
    }

    /// Resolve a path to a runnable task; a collection stands for its default task.
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Collection::lookup`], plus `LookupError::NoDefaultTask`
    /// when the path (or an empty path) names a collection without a default.
    pub fn resolve_task(&self, path: &str, policy: MatchPolicy) -> Result<TaskRef, LookupError> {
        if path.is_empty() {
            return self
                .default_task()
                .ok_or_else(|| LookupError::NoDefaultTask(self.path.clone()));
        }
        let found = self.lookup(path, policy)?;
        match found.node {
            Node::Task(task) => Ok(TaskRef {
                path: join_path(&self.path, &found.path),
                task: Arc::clone(task),
            }),
            Node::Collection(child) => child
                .default_task()
                .ok_or_else(|| LookupError::NoDefaultTask(child.path.clone())),
        }
    }

    /// All tasks in this tree, depth first, in registration order.
    #[must_use]
    pub fn tasks(&self) -> Vec<TaskRef> {
        let mut out = Vec::new();
        self.collect_tasks(&mut out);
        out
    }

    fn collect_tasks(&self, out: &mut Vec<TaskRef>) {
        for (name, node) in &self.entries {
            match node {
                Node::Task(task) => out.push(TaskRef {
                    path: join_path(&self.path, name),
                    task: Arc::clone(task),
                }),
                Node::Collection(child) => child.collect_tasks(out),
            }
        }
    }

    /// Pre/post references resolve against the owning scope first, then the root.
    fn resolve_reference(&self, scope: &str, reference: &str) -> Option<TaskRef> {
        if !scope.is_empty()
            && let Ok(found) = self.resolve_task(&join_path(scope, reference), MatchPolicy::Exact)
        {
            return Some(found);
        }
        self.resolve_task(reference, MatchPolicy::Exact).ok()
    }

    fn rewrite_references(&mut self, resolved: &HashMap<String, (Vec<String>, Vec<String>)>) {
        let scope = self.path.clone();
        for (name, node) in &mut self.entries {
            match node {
                Node::Task(task) => {
                    if let Some((pre, post)) = resolved.get(&join_path(&scope, name)) {
                        let task = Arc::make_mut(task);
                        task.pre.clone_from(pre);
                        task.post.clone_from(post);
                    }
                }
                Node::Collection(child) => child.rewrite_references(resolved),
            }
        }
    }

    fn find_child(
        &self,
        segment: &str,
        policy: MatchPolicy,
    ) -> Result<Option<(&str, &Node)>, LookupError> {
        let wanted = normalize(segment);
        let exact = self.entries.iter().find(|(name, node)| {
            normalize(name) == wanted
                || matches!(node, Node::Task(task) if task.aliases.iter().any(|a| normalize(a) == wanted))
        });
        if let Some((name, node)) = exact {
            return Ok(Some((name.as_str(), node)));
        }
        if policy == MatchPolicy::Exact || wanted.is_empty() {
            return Ok(None);
        }

        let candidates: Vec<&(String, Node)> = self
            .entries
            .iter()
            .filter(|(name, _)| normalize(name).starts_with(&wanted))
            .collect();
        match candidates.as_slice() {
            [] => Ok(None),
            [(name, node)] => Ok(Some((name.as_str(), node))),
            many => Err(LookupError::AmbiguousName {
                segment: segment.to_string(),
                candidates: many
                    .iter()
                    .map(|(name, _)| join_path(&self.path, name))
                    .collect(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::noop()
    }

    fn sample() -> Collection {
        let db = CollectionBuilder::new()
            .with("migrate", task())
            .unwrap()
            .with("seed", task().alias("s"))
            .unwrap()
            .with_default("migrate");
        CollectionBuilder::new()
            .with("build", task().pre("clean"))
            .unwrap()
            .with("clean", task())
            .unwrap()
            .with("deploy", task())
            .unwrap()
            .with("db", db)
            .unwrap()
            .with("docs", CollectionBuilder::new().with("serve", task()).unwrap())
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut builder = CollectionBuilder::new();
        builder.register("build", task()).unwrap();
        let err = builder.register("build", CollectionBuilder::new()).unwrap_err();
        assert_eq!(err, CollectionError::DuplicateName("build".to_string()));
    }

    #[test]
    fn test_dash_and_underscore_collide() {
        let mut builder = CollectionBuilder::new();
        builder.register("run_tests", task()).unwrap();
        assert!(matches!(
            builder.register("run-tests", task()),
            Err(CollectionError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_alias_collides_with_existing_name() {
        let mut builder = CollectionBuilder::new();
        builder.register("build", task()).unwrap();
        let err = builder.register("compile", task().alias("build")).unwrap_err();
        assert_eq!(err, CollectionError::DuplicateName("build".to_string()));
    }

    #[test]
    fn test_dotted_name_rejected() {
        let mut builder = CollectionBuilder::new();
        assert_eq!(
            builder.register("a.b", task()).unwrap_err(),
            CollectionError::InvalidName("a.b".to_string())
        );
    }

    #[test]
    fn test_lookup_exact_paths() {
        let root = sample();
        for path in ["build", "db.migrate", "db.seed", "docs.serve"] {
            let found = root.resolve_task(path, MatchPolicy::Exact).unwrap();
            assert_eq!(found.path, path);
        }
        assert!(matches!(
            root.lookup("db", MatchPolicy::Exact).unwrap().node,
            Node::Collection(_)
        ));
    }

    #[test]
    fn test_lookup_missing_path() {
        let root = sample();
        for path in ["frobnicate", "db.frob", "build.extra", "db..migrate"] {
            assert_eq!(
                root.lookup(path, MatchPolicy::UniquePrefix).unwrap_err(),
                LookupError::NotFound(path.to_string()),
                "{path}"
            );
        }
    }

    #[test]
    fn test_unique_prefix_match() {
        let root = sample();
        let found = root.resolve_task("dep", MatchPolicy::UniquePrefix).unwrap();
        assert_eq!(found.path, "deploy");
        let found = root.resolve_task("db.mig", MatchPolicy::UniquePrefix).unwrap();
        assert_eq!(found.path, "db.migrate");
        assert!(root.resolve_task("dep", MatchPolicy::Exact).is_err());
    }

    #[test]
    fn test_ambiguous_prefix() {
        let root = sample();
        let err = root.lookup("d", MatchPolicy::UniquePrefix).unwrap_err();
        assert_eq!(
            err,
            LookupError::AmbiguousName {
                segment: "d".to_string(),
                candidates: vec!["deploy".to_string(), "db".to_string(), "docs".to_string()],
            }
        );
    }

    #[test]
    fn test_alias_lookup_returns_canonical_path() {
        let root = sample();
        let found = root.resolve_task("db.s", MatchPolicy::Exact).unwrap();
        assert_eq!(found.path, "db.seed");
    }

    #[test]
    fn test_collection_falls_back_to_default_task() {
        let root = sample();
        assert_eq!(root.resolve_task("db", MatchPolicy::Exact).unwrap().path, "db.migrate");
        assert_eq!(
            root.resolve_task("docs", MatchPolicy::Exact).unwrap_err(),
            LookupError::NoDefaultTask("docs".to_string())
        );
        assert_eq!(
            root.resolve_task("", MatchPolicy::Exact).unwrap_err(),
            LookupError::NoDefaultTask(String::new())
        );
    }

    #[test]
    fn test_invalid_default_rejected() {
        let err = CollectionBuilder::new()
            .with("build", task())
            .unwrap()
            .with_default("nope")
            .build()
            .unwrap_err();
        assert!(matches!(err, CollectionError::InvalidDefault { .. }));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let err = CollectionBuilder::new()
            .with("build", task().pre("missing"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            CollectionError::UnknownReference {
                task: "build".to_string(),
                reference: "missing".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_rejected_at_build() {
        let err = CollectionBuilder::new()
            .with("a", task().pre("b"))
            .unwrap()
            .with("b", task().pre("c"))
            .unwrap()
            .with("c", task().pre("a"))
            .unwrap()
            .build()
            .unwrap_err();
        assert_eq!(err, CollectionError::Cycle("a -> b -> c -> a".to_string()));
    }

    #[test]
    fn test_post_edge_back_to_owner_is_allowed() {
        let root = CollectionBuilder::new()
            .with("build", task().post("notify"))
            .unwrap()
            .with("notify", task().pre("build"))
            .unwrap()
            .build()
            .unwrap();
        let notify = root.resolve_task("notify", MatchPolicy::Exact).unwrap();
        assert_eq!(notify.task.pre, vec!["build".to_string()]);
    }

    #[test]
    fn test_references_prefer_sibling_scope() {
        let db = CollectionBuilder::new()
            .with("check", task())
            .unwrap()
            .with("up", task().pre("check").pre("lint"))
            .unwrap();
        let root = CollectionBuilder::new()
            .with("check", task())
            .unwrap()
            .with("lint", task())
            .unwrap()
            .with("db", db)
            .unwrap()
            .build()
            .unwrap();
        let up = root.resolve_task("db.up", MatchPolicy::Exact).unwrap();
        assert_eq!(up.task.pre, vec!["db.check".to_string(), "lint".to_string()]);
    }

    #[test]
    fn test_tasks_depth_first() {
        let paths: Vec<String> = sample().tasks().into_iter().map(|t| t.path).collect();
        assert_eq!(
            paths,
            ["build", "clean", "deploy", "db.migrate", "db.seed", "docs.serve"]
        );
    }
}

//! Sequential execution of an invocation plan

use std::any::Any;
use std::cell::Cell;
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::sync::Once;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::context::Context;
use crate::resolver::{InvocationPlan, Origin, PlannedTask};
use crate::tasks::params::Arguments;
use crate::tasks::task::{TaskFailure, TaskOutput};

/// Lifecycle of a plan entry: `Pending -> Running -> Succeeded | Failed`, or `Pending -> Skipped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl TaskState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Skipped
        )
    }

    #[must_use]
    pub fn can_become(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Running | TaskState::Skipped)
                | (TaskState::Running, TaskState::Succeeded | TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        f.write_str(label)
    }
}

/// Why an entry was never run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// An earlier entry failed and the run is fail-fast
    EarlierFailure,
    /// A pre-requisite of this entry failed or was itself skipped for that reason
    DependencyFailed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EarlierFailure => f.write_str("earlier failure"),
            SkipReason::DependencyFailed => f.write_str("dependency failed"),
        }
    }
}

/// What happened to one plan entry
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub path: String,
    pub args: Arguments,
    pub origin: Origin,
    pub state: TaskState,
    pub skip_reason: Option<SkipReason>,
    pub output: Option<TaskOutput>,
    pub failure: Option<TaskFailure>,
    pub duration: Duration,
}

impl ExecutionResult {
    fn new(entry: &PlannedTask, state: TaskState) -> Self {
        Self {
            path: entry.path.clone(),
            args: entry.args.clone(),
            origin: entry.origin,
            state,
            skip_reason: None,
            output: None,
            failure: None,
            duration: Duration::ZERO,
        }
    }
}

/// Receives progress while a plan runs
pub trait Observer {
    /// An entry moved to `Running`
    fn on_start(&mut self, _index: usize, _total: usize, _entry: &PlannedTask) {}

    /// An entry reached a terminal state
    fn on_finish(&mut self, _index: usize, _total: usize, _result: &ExecutionResult) {}

    /// Every entry has reached a terminal state
    fn on_complete(&mut self, _results: &[ExecutionResult], _elapsed: Duration) {}
}

/// Runs plans against a context it owns for the invocation
pub struct Executor {
    context: Context,
    continue_on_failure: bool,
    observers: Vec<Box<dyn Observer>>,
}

impl Executor {
    /// Continue mode starts from the context's `tasks.continue_on_failure`.
    #[must_use]
    pub fn new(context: Context) -> Self {
        let continue_on_failure = context.continue_on_failure();
        Self {
            context,
            continue_on_failure,
            observers: Vec::new(),
        }
    }

    #[must_use]
    pub fn continue_on_failure(mut self, enabled: bool) -> Self {
        self.continue_on_failure = enabled;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: impl Observer + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    /// Run every entry in plan order, consuming the executor and the plan.
    pub fn run(mut self, plan: InvocationPlan) -> Vec<ExecutionResult> {
        let total = plan.len();
        let started = Instant::now();
        let mut results: Vec<ExecutionResult> = Vec::with_capacity(total);
        let mut halted = false;
        // Paths that failed, or were skipped because something they need failed
        let mut failed: HashSet<&str> = HashSet::new();

        info!("Invocation {} running {total} tasks", plan.id);
        for (index, entry) in plan.entries.iter().enumerate() {
            let mut state = TaskState::Pending;

            let skip = if halted {
                Some(SkipReason::EarlierFailure)
            } else if entry.task.pre.iter().any(|pre| failed.contains(pre.as_str())) {
                failed.insert(&entry.path);
                Some(SkipReason::DependencyFailed)
            } else {
                None
            };
            if let Some(reason) = skip {
                debug_assert!(state.can_become(TaskState::Skipped));
                state = TaskState::Skipped;
                debug!("{} is {state} ({reason})", entry.path);
                let mut result = ExecutionResult::new(entry, state);
                result.skip_reason = Some(reason);
                self.notify(|o| o.on_finish(index, total, &result));
                results.push(result);
                continue;
            }

            debug_assert!(state.can_become(TaskState::Running));
            state = TaskState::Running;
            debug!("{} is {state}", entry.path);
            self.notify(|o| o.on_start(index, total, entry));

            let start = Instant::now();
            let outcome = self.call(entry);
            let mut result = ExecutionResult::new(entry, state);
            result.duration = start.elapsed();
            match outcome {
                Ok(output) => {
                    result.state = TaskState::Succeeded;
                    result.output = Some(output);
                }
                Err(failure) => {
                    info!("{} failed: {failure}", entry.path);
                    failed.insert(&entry.path);
                    result.state = TaskState::Failed;
                    result.failure = Some(failure);
                    if !self.continue_on_failure {
                        halted = true;
                    }
                }
            }
            debug!("{} is {}", entry.path, result.state);
            self.notify(|o| o.on_finish(index, total, &result));
            results.push(result);
        }

        let elapsed = started.elapsed();
        info!(
            "Invocation {} finished in {:.3}s",
            plan.id,
            elapsed.as_secs_f64()
        );
        self.notify(|o| o.on_complete(&results, elapsed));
        results
    }

    fn call(&self, entry: &PlannedTask) -> Result<TaskOutput, TaskFailure> {
        install_panic_hook();
        let body = entry.task.body();
        IN_TASK.with(|flag| flag.set(true));
        let outcome = catch_unwind(AssertUnwindSafe(|| body.call(&self.context, &entry.args)));
        IN_TASK.with(|flag| flag.set(false));
        outcome.unwrap_or_else(|payload| {
            Err(TaskFailure::new(format!(
                "task panicked: {}",
                panic_message(payload.as_ref())
            )))
        })
    }

    fn notify(&mut self, mut f: impl FnMut(&mut dyn Observer)) {
        for observer in &mut self.observers {
            f(observer.as_mut());
        }
    }
}

thread_local! {
    static IN_TASK: Cell<bool> = const { Cell::new(false) };
}

static PANIC_HOOK: Once = Once::new();

/// Keep panics inside task bodies off the terminal; they are reported as failures.
/// Panics anywhere else still reach the previously installed hook.
fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if IN_TASK.with(Cell::get) {
                debug!("Task body {info}");
            } else {
                previous(info);
            }
        }));
    });
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// Process exit status for a finished run: 0 when nothing failed, 1 otherwise.
#[must_use]
pub fn exit_code(results: &[ExecutionResult]) -> u8 {
    u8::from(results.iter().any(|r| r.state == TaskState::Failed))
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::context::ContextBuilder;
    use crate::resolver::Resolver;
    use crate::tasks::collection::{Collection, CollectionBuilder};
    use crate::tasks::task::Task;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording(log: &Log, name: &'static str, fail: bool) -> Task {
        let log = Arc::clone(log);
        Task::from_fn(move |_, _| {
            log.lock().unwrap().push(name.to_string());
            if fail {
                Err(TaskFailure::new(format!("{name} broke")))
            } else {
                Ok(TaskOutput::default())
            }
        })
    }

    fn lint_and_test(log: &Log) -> Collection {
        CollectionBuilder::new()
            .with("lint", recording(log, "lint", true))
            .unwrap()
            .with("test", recording(log, "test", false))
            .unwrap()
            .build()
            .unwrap()
    }

    fn states(results: &[ExecutionResult]) -> Vec<TaskState> {
        results.iter().map(|r| r.state).collect()
    }

    #[test]
    fn test_fail_fast_skips_remaining() {
        let log = Log::default();
        let root = lint_and_test(&log);
        let plan = Resolver::new(&root).resolve(&["lint", "test"]).unwrap();
        let results = Executor::new(Context::default()).run(plan);

        assert_eq!(states(&results), [TaskState::Failed, TaskState::Skipped]);
        assert_eq!(*log.lock().unwrap(), ["lint"]);
        assert_eq!(
            results[0].failure.as_ref().map(ToString::to_string),
            Some("lint broke".to_string())
        );
        assert_eq!(exit_code(&results), 1);
    }

    #[test]
    fn test_continue_mode_runs_everything() {
        let log = Log::default();
        let root = lint_and_test(&log);
        let plan = Resolver::new(&root).resolve(&["lint", "test"]).unwrap();
        let results = Executor::new(Context::default())
            .continue_on_failure(true)
            .run(plan);

        assert_eq!(states(&results), [TaskState::Failed, TaskState::Succeeded]);
        assert_eq!(*log.lock().unwrap(), ["lint", "test"]);
        assert_eq!(exit_code(&results), 1);
    }

    #[test]
    fn test_continue_mode_from_context() {
        let log = Log::default();
        let root = lint_and_test(&log);
        let plan = Resolver::new(&root).resolve(&["lint", "test"]).unwrap();
        let ctx = ContextBuilder::new()
            .set("tasks.continue_on_failure", "true")
            .build();
        let results = Executor::new(ctx).run(plan);
        assert_eq!(states(&results), [TaskState::Failed, TaskState::Succeeded]);
    }

    #[test]
    fn test_earlier_successes_are_kept() {
        let log = Log::default();
        let root = CollectionBuilder::new()
            .with("fmt", recording(&log, "fmt", false))
            .unwrap()
            .with("lint", recording(&log, "lint", true))
            .unwrap()
            .with("test", recording(&log, "test", false))
            .unwrap()
            .build()
            .unwrap();
        let plan = Resolver::new(&root)
            .resolve(&["fmt", "lint", "test"])
            .unwrap();
        let results = Executor::new(Context::default()).run(plan);
        assert_eq!(
            states(&results),
            [TaskState::Succeeded, TaskState::Failed, TaskState::Skipped]
        );
        assert!(results[0].output.is_some());
    }

    #[test]
    fn test_body_sees_context_and_arguments() {
        let seen = Log::default();
        let sink = Arc::clone(&seen);
        let root = CollectionBuilder::new()
            .with(
                "greet",
                Task::from_fn(move |ctx, args| {
                    let line = format!(
                        "{} {}",
                        ctx.get_str("greeting").unwrap_or("?"),
                        args.get_str("name").unwrap_or("?")
                    );
                    sink.lock().unwrap().push(line);
                    Ok(TaskOutput::default())
                })
                .param(crate::tasks::params::Parameter::new(
                    "name",
                    crate::tasks::params::ParamKind::String,
                )),
            )
            .unwrap()
            .build()
            .unwrap();
        let plan = Resolver::new(&root).resolve(&["greet", "ada"]).unwrap();
        let ctx = ContextBuilder::new().set("greeting", "hello").build();
        let results = Executor::new(ctx).run(plan);
        assert_eq!(exit_code(&results), 0);
        assert_eq!(*seen.lock().unwrap(), ["hello ada"]);
    }

    #[test]
    fn test_panic_is_a_failure() {
        let root = CollectionBuilder::new()
            .with(
                "boom",
                Task::from_fn(|_, _| {
                    assert!(IN_TASK.with(Cell::get), "body runs inside the quiet panic scope");
                    panic!("kaboom")
                }),
            )
            .unwrap()
            .build()
            .unwrap();
        let plan = Resolver::new(&root).resolve(&["boom"]).unwrap();
        let results = Executor::new(Context::default()).run(plan);
        assert_eq!(results[0].state, TaskState::Failed);
        assert_eq!(
            results[0].failure.as_ref().unwrap().message,
            "task panicked: kaboom"
        );
        assert!(!IN_TASK.with(Cell::get));
        assert!(PANIC_HOOK.is_completed());
    }

    fn build_and_deploy(log: &Log) -> Collection {
        CollectionBuilder::new()
            .with("build", recording(log, "build", true))
            .unwrap()
            .with("deploy", recording(log, "deploy", false).pre("build"))
            .unwrap()
            .with("smoke", recording(log, "smoke", false).pre("deploy"))
            .unwrap()
            .with("docs", recording(log, "docs", false))
            .unwrap()
            .build()
            .unwrap()
    }

    #[test]
    fn test_continue_mode_skips_dependents_of_a_failure() {
        let log = Log::default();
        let root = build_and_deploy(&log);
        let plan = Resolver::new(&root).resolve(&["smoke", "docs"]).unwrap();
        assert_eq!(plan.paths(), ["build", "deploy", "smoke", "docs"]);
        let results = Executor::new(Context::default())
            .continue_on_failure(true)
            .run(plan);

        assert_eq!(
            states(&results),
            [
                TaskState::Failed,
                TaskState::Skipped,
                TaskState::Skipped,
                TaskState::Succeeded
            ]
        );
        let reasons: Vec<Option<SkipReason>> = results.iter().map(|r| r.skip_reason).collect();
        assert_eq!(
            reasons,
            [
                None,
                Some(SkipReason::DependencyFailed),
                Some(SkipReason::DependencyFailed),
                None
            ]
        );
        assert_eq!(*log.lock().unwrap(), ["build", "docs"]);
        assert_eq!(exit_code(&results), 1);
    }

    #[test]
    fn test_fail_fast_skip_reason() {
        let log = Log::default();
        let root = build_and_deploy(&log);
        let plan = Resolver::new(&root).resolve(&["deploy", "docs"]).unwrap();
        let results = Executor::new(Context::default()).run(plan);
        let reasons: Vec<Option<SkipReason>> = results.iter().map(|r| r.skip_reason).collect();
        assert_eq!(
            reasons,
            [
                None,
                Some(SkipReason::EarlierFailure),
                Some(SkipReason::EarlierFailure)
            ]
        );
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl Observer for Recorder {
        fn on_start(&mut self, index: usize, total: usize, entry: &PlannedTask) {
            self.0
                .lock()
                .unwrap()
                .push(format!("start {}/{total} {}", index + 1, entry.path));
        }

        fn on_finish(&mut self, _index: usize, _total: usize, result: &ExecutionResult) {
            self.0
                .lock()
                .unwrap()
                .push(format!("{} {}", result.state, result.path));
        }

        fn on_complete(&mut self, results: &[ExecutionResult], _elapsed: Duration) {
            self.0.lock().unwrap().push(format!("done {}", results.len()));
        }
    }

    #[test]
    fn test_observer_sees_state_transitions() {
        let log = Log::default();
        let root = lint_and_test(&log);
        let plan = Resolver::new(&root).resolve(&["lint", "test"]).unwrap();
        let recorder = Recorder::default();
        Executor::new(Context::default())
            .with_observer(recorder.clone())
            .run(plan);
        assert_eq!(
            *recorder.0.lock().unwrap(),
            [
                "start 1/2 lint",
                "failed lint",
                "skipped test",
                "done 2"
            ]
        );
    }

    #[test]
    fn test_state_transitions() {
        assert!(TaskState::Pending.can_become(TaskState::Running));
        assert!(TaskState::Pending.can_become(TaskState::Skipped));
        assert!(TaskState::Running.can_become(TaskState::Failed));
        assert!(!TaskState::Skipped.can_become(TaskState::Running));
        assert!(!TaskState::Succeeded.can_become(TaskState::Failed));
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Running.is_terminal());
    }
}

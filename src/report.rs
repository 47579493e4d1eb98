use std::io::{IsTerminal, Write};
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};

use crate::executor::{ExecutionResult, Observer, SkipReason, TaskState};
use crate::resolver::PlannedTask;

const BOLD: Style = Style::new().effects(Effects::BOLD);
const DIM: Style = Style::new().effects(Effects::DIMMED);
const GREEN: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Green)));
const RED: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Red)));
const YELLOW: Style = Style::new().fg_color(Some(anstyle::Color::Ansi(AnsiColor::Yellow)));

/// Totals for a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Summary {
    #[must_use]
    pub fn of(results: &[ExecutionResult]) -> Self {
        results.iter().fold(Self::default(), |mut acc, r| {
            match r.state {
                TaskState::Succeeded => acc.passed += 1,
                TaskState::Failed => acc.failed += 1,
                TaskState::Skipped => acc.skipped += 1,
                TaskState::Pending | TaskState::Running => {}
            }
            acc
        })
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

#[must_use]
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let tenths = d.subsec_millis() / 100;
    if total_secs < 60 {
        format!("{total_secs}.{tenths}s")
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{mins}m {secs}.{tenths}s")
    }
}

/// Prints `[i/n] task PASS 0.1s` progress lines and a final summary
pub struct ConsoleReporter<W: Write> {
    out: W,
    color: bool,
}

impl ConsoleReporter<std::io::Stderr> {
    /// Report to stderr, coloured only when stderr is a terminal.
    #[must_use]
    pub fn stderr() -> Self {
        let color = std::io::stderr().is_terminal();
        Self::new(std::io::stderr(), color)
    }
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn paint(&self, style: Style, s: &str) -> String {
        if self.color {
            format!("{style}{s}{style:#}")
        } else {
            s.to_string()
        }
    }

    fn prefix(index: usize, total: usize) -> String {
        let width = total.to_string().len();
        format!("[{:>width$}/{total}]", index + 1)
    }
}

impl<W: Write> Observer for ConsoleReporter<W> {
    fn on_start(&mut self, index: usize, total: usize, entry: &PlannedTask) {
        let prefix = self.paint(BOLD, &Self::prefix(index, total));
        let _ = writeln!(self.out, "{prefix} {entry}");
        let _ = self.out.flush();
    }

    fn on_finish(&mut self, index: usize, total: usize, result: &ExecutionResult) {
        let prefix = Self::prefix(index, total);
        let line = match result.state {
            TaskState::Succeeded => format!(
                "{} {} {}",
                self.paint(DIM, &prefix),
                self.paint(GREEN, "PASS"),
                self.paint(DIM, &format_duration(result.duration))
            ),
            TaskState::Failed => {
                let reason = result
                    .failure
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                format!(
                    "{} {} {} {}",
                    self.paint(DIM, &prefix),
                    self.paint(RED, "FAIL"),
                    self.paint(DIM, &format_duration(result.duration)),
                    reason
                )
            }
            TaskState::Skipped => {
                let reason = result.skip_reason.unwrap_or(SkipReason::EarlierFailure);
                format!(
                    "{} {} {}",
                    self.paint(DIM, &prefix),
                    result.path,
                    self.paint(YELLOW, &format!("SKIP ({reason})"))
                )
            }
            TaskState::Pending | TaskState::Running => return,
        };
        let _ = writeln!(self.out, "{line}");

        // Captured output is only worth showing when something went wrong
        if let Some(failure) = &result.failure {
            let _ = self.out.write_all(failure.output.stdout.as_bytes());
            let _ = self.out.write_all(failure.output.stderr.as_bytes());
        }
    }

    fn on_complete(&mut self, results: &[ExecutionResult], elapsed: Duration) {
        let summary = Summary::of(results);
        let mut parts = Vec::new();
        if summary.passed > 0 {
            parts.push(self.paint(GREEN, &format!("{} passed", summary.passed)));
        }
        if summary.failed > 0 {
            parts.push(self.paint(RED, &format!("{} failed", summary.failed)));
        }
        if summary.skipped > 0 {
            parts.push(self.paint(YELLOW, &format!("{} skipped", summary.skipped)));
        }
        let noun = if summary.total() == 1 { "task" } else { "tasks" };
        let _ = writeln!(
            self.out,
            "\n{} {} {}",
            self.paint(BOLD, &format!("{} {noun}:", summary.total())),
            parts.join(&self.paint(DIM, ", ")),
            self.paint(DIM, &format!("({})", format_duration(elapsed)))
        );
        let _ = self.out.flush();
    }
}

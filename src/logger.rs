use std::io::Write;
use std::time::Instant;

use anstyle::{AnsiColor, Color, Style};
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;

struct InvokerLogger {
    file: Option<Mutex<std::fs::File>>,
    filter: LevelFilter,
    color: bool,
    start: Instant,
}

impl Log for InvokerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = if self.color {
            let style = level_style(record.level());
            format!("{style}{}{style:#}", record.level())
        } else {
            record.level().to_string()
        };
        let _ = writeln!(std::io::stderr().lock(), "[{level}] {}", record.args());

        if let Some(ref file) = self.file {
            let elapsed = self.start.elapsed().as_secs_f64();
            let _ = writeln!(
                file.lock(),
                "[{elapsed:.3}s] [{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        if let Some(ref file) = self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Pick the level filter: `RUST_LOG` wins, then `--debug`, then warnings only.
#[must_use]
pub fn filter_from(rust_log: Option<&str>, debug: bool) -> LevelFilter {
    rust_log
        .and_then(|s| s.parse().ok())
        .unwrap_or(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
}

/// Initialize the global logger. Must be called once before any logging.
///
/// # Errors
///
/// Returns `SetLoggerError` if a logger is already installed.
pub fn init(debug: bool, log_file: Option<std::fs::File>) -> Result<(), SetLoggerError> {
    let filter = filter_from(std::env::var("RUST_LOG").ok().as_deref(), debug);

    let logger = InvokerLogger {
        file: log_file.map(Mutex::new),
        filter,
        color: std::io::IsTerminal::is_terminal(&std::io::stderr()),
        start: Instant::now(),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(filter);
    Ok(())
}

fn level_style(level: Level) -> Style {
    let color = match level {
        Level::Error => AnsiColor::Red,
        Level::Warn => AnsiColor::Yellow,
        Level::Info => AnsiColor::Blue,
        Level::Debug | Level::Trace => AnsiColor::BrightBlack,
    };
    Style::new().fg_color(Some(Color::Ansi(color)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_precedence() {
        assert_eq!(filter_from(None, false), LevelFilter::Warn);
        assert_eq!(filter_from(None, true), LevelFilter::Debug);
        assert_eq!(filter_from(Some("trace"), false), LevelFilter::Trace);
        assert_eq!(filter_from(Some("nonsense"), true), LevelFilter::Debug);
    }
}

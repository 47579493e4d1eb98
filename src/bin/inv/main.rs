use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use log::debug;

use invoker::context::ContextBuilder;
use invoker::executor::{Executor, exit_code};
use invoker::listing::{self, ListFormat};
use invoker::load_config;
use invoker::report::ConsoleReporter;
use invoker::resolver::{Resolver, ResolverOptions, split_remainder};
use invoker::tasks::collection::{MatchPolicy, Node};

/// Exit status for resolution, argument and task file errors
const USAGE_ERROR: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "inv",
    version,
    about = "Run tasks from a namespaced task file",
    override_usage = "inv [OPTIONS] [TASK [ARGS...]]... [-- REMAINDER...]"
)]
struct Cli {
    /// List available tasks, optionally only those of one collection
    #[arg(short, long, value_name = "COLLECTION", num_args = 0..=1, default_missing_value = "")]
    list: Option<String>,

    /// Layout used by --list
    #[arg(long, value_name = "FORMAT", default_value = "flat")]
    list_format: ListFormat,

    /// Path to task file (auto-detected if not specified)
    #[arg(short, long)]
    config: Option<String>,

    /// Override a configuration value, e.g. --set run.echo=true
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,

    /// Keep running the remaining tasks after a failure
    #[arg(short = 'k', long)]
    continue_on_failure: bool,

    /// Log file path (enables file logging in addition to stderr)
    #[arg(long)]
    log_file: Option<String>,

    /// Show debug logging
    #[arg(short, long)]
    debug: bool,

    /// Tasks to run, each followed by its own arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "TASK")]
    tasks: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(USAGE_ERROR)
        }
    }
}

fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_file = cli
        .log_file
        .as_deref()
        .map(std::fs::File::create)
        .transpose()?;
    invoker::logger::init(cli.debug, log_file)?;

    let project = load_config(cli.config.as_deref())?;

    if let Some(ref collection) = cli.list {
        let text = if collection.is_empty() {
            listing::render(&project.root, cli.list_format)?
        } else {
            let found = project.root.lookup(collection, MatchPolicy::UniquePrefix)?;
            match found.node {
                Node::Collection(child) => listing::render(child, cli.list_format)?,
                Node::Task(_) => {
                    return Err(format!("'{}' is a task, not a collection", found.path).into());
                }
            }
        };
        print!("{text}");
        return Ok(ExitCode::SUCCESS);
    }

    let (requested, remainder) = split_remainder(&cli.tasks);
    if requested.is_empty() && project.root.default_task().is_none() {
        eprintln!("{}", Cli::command().render_usage());
        return Ok(ExitCode::from(USAGE_ERROR));
    }

    let mut context = ContextBuilder::new()
        .file(project.config)?
        .env(std::env::vars());
    for assignment in &cli.overrides {
        context = context.set_override(assignment)?;
    }
    let context = context.remainder(remainder.to_vec()).build();

    let options = ResolverOptions::from_context(&context)?;
    let plan = Resolver::new(&project.root)
        .with_options(options)
        .resolve(&cli.tasks)?;
    debug!("Running {} tasks from {}", plan.len(), project.path.display());

    let mut executor = Executor::new(context).with_observer(ConsoleReporter::stderr());
    if cli.continue_on_failure {
        executor = executor.continue_on_failure(true);
    }
    let results = executor.run(plan);

    Ok(ExitCode::from(exit_code(&results)))
}

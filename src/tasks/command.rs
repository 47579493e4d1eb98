use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Command as ProcessCommand, Stdio};
use std::sync::OnceLock;

use log::{debug, warn};
use regex::{Captures, Regex};

use crate::context::Context;
use crate::tasks::params::{Arguments, normalize};
use crate::tasks::task::{TaskBody, TaskFailure, TaskOutput};

/// A task body that runs a shell command template
#[derive(Debug, Clone, Default)]
pub struct CommandBody {
    pub cmd: String,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    /// Parameters of kind `flag`; `{name}` renders as `--name` or nothing
    pub flags: Vec<String>,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_-]*)\}").expect("placeholder pattern is valid")
    })
}

/// Quote `value` as a single `sh` word, leaving plain words untouched.
fn quote(value: &str) -> String {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if plain {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

impl CommandBody {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn flag(mut self, name: &str) -> Self {
        self.flags.push(normalize(name));
        self
    }

    /// Substitute `{param}` placeholders with bound argument values, each quoted as one word.
    /// Unknown placeholders are left untouched.
    #[must_use]
    pub fn render(&self, args: &Arguments) -> String {
        placeholder()
            .replace_all(&self.cmd, |caps: &Captures| {
                let name = &caps[1];
                let Some(value) = args.get(name) else {
                    return caps[0].to_string();
                };
                let flag = normalize(name);
                if self.flags.contains(&flag) {
                    return match value.as_bool() {
                        Some(true) => format!("--{flag}"),
                        _ => String::new(),
                    };
                }
                quote(&value.to_string())
            })
            .into_owned()
    }
}

impl TaskBody for CommandBody {
    fn call(&self, ctx: &Context, args: &Arguments) -> Result<TaskOutput, TaskFailure> {
        let rendered = self.render(args);
        let shell = ctx.get_str("run.shell").unwrap_or("sh");
        let hide = ctx.get_bool("run.hide").unwrap_or(false);
        let warn_only = ctx.get_bool("run.warn").unwrap_or(false);

        if ctx.get_bool("run.echo").unwrap_or(false) {
            eprintln!("$ {rendered}");
        }

        let mut env = ctx.get_string_map("run.env");
        env.extend(self.env.clone());

        let mut process = ProcessCommand::new(shell);
        process.arg("-c").arg(&rendered).envs(&env);
        if !self.cwd.as_os_str().is_empty() {
            process.current_dir(&self.cwd);
        }
        if ctx.remainder().is_empty() {
            debug!("Running `{rendered}` with {shell}");
        } else {
            // Extra tokens after `--` become $1, $2, ... of the shell script
            process.arg(shell).args(ctx.remainder());
            debug!("Running `{rendered}` with {shell} and {} extra args", ctx.remainder().len());
        }

        let output = if hide {
            process.output().map(|o| TaskOutput {
                stdout: String::from_utf8_lossy(&o.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&o.stderr).into_owned(),
                exit_code: o.status.code(),
            })
        } else {
            process
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()
                .map(|status| TaskOutput {
                    exit_code: status.code(),
                    ..Default::default()
                })
        };

        let output = output.map_err(|e| TaskFailure::new(format!("unable to start {shell}: {e}")))?;
        match output.exit_code {
            Some(0) => Ok(output),
            code if warn_only => {
                warn!("`{rendered}` exited with {code:?}, continuing because run.warn is set");
                Ok(output)
            }
            code => Err(TaskFailure {
                message: match code {
                    Some(code) => format!("`{rendered}` exited with code {code}"),
                    None => format!("`{rendered}` was terminated by a signal"),
                },
                exit_code: code,
                output,
            }),
        }
    }
}

use std::path::Path;
use std::process::{Command, Output};

fn write_tasks(dir: &Path, content: &str) -> String {
    let path = dir.join(".invoker.yaml");
    std::fs::write(&path, content).unwrap();
    path.to_string_lossy().into_owned()
}

fn inv(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_inv"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .unwrap()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const TASKS: &str = r#"
invoker_version: "0.1.0"
config:
  run:
    hide: true
tasks:
  - name: build
    cmd: echo build >> log.txt
  - name: lint
    cmd: exit 1
  - name: test
    cmd: echo test >> log.txt
"#;

#[test]
fn test_unknown_task_exits_2_without_running_anything() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_tasks(dir.path(), TASKS);

    let output = inv(dir.path(), &["-c", &config, "build", "frobnicate"]);
    assert_eq!(output.status.code(), Some(2));
    assert_eq!(
        stderr(&output),
        "Error: no task or collection named 'frobnicate'\n"
    );
    assert!(!dir.path().join("log.txt").exists());
}

#[test]
fn test_bare_invocation_without_default_prints_usage() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_tasks(dir.path(), TASKS);

    let output = inv(dir.path(), &["-c", &config]);
    assert_eq!(output.status.code(), Some(2));
    assert!(
        stderr(&output).contains("inv [OPTIONS] [TASK [ARGS...]]..."),
        "{}",
        stderr(&output)
    );
    assert!(!dir.path().join("log.txt").exists());
}

#[test]
fn test_task_failure_exits_1_and_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_tasks(dir.path(), TASKS);

    let output = inv(dir.path(), &["-c", &config, "lint", "test"]);
    assert_eq!(output.status.code(), Some(1));
    let text = stderr(&output);
    assert_eq!(text.matches("exited with code 1").count(), 1, "{text}");
    assert!(!text.contains("[WARN]"), "{text}");
    assert!(text.contains("test SKIP (earlier failure)"), "{text}");
    assert!(!dir.path().join("log.txt").exists());
}

#[test]
fn test_success_exits_0() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_tasks(dir.path(), TASKS);

    let output = inv(dir.path(), &["-c", &config, "build", "test"]);
    assert_eq!(output.status.code(), Some(0));
    let log = std::fs::read_to_string(dir.path().join("log.txt")).unwrap();
    assert_eq!(log, "build\ntest\n");
}

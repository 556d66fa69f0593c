//! CLI tests: spawn the `ralph` binary and check exit codes and output.

use std::fs;
use std::io::Write;
use std::process::{Command, Output, Stdio};

use ralph::exit_codes;
use ralph::io::signal::{
    ENV_CURRENT_TASK_ID, ENV_PLAN_PATH, ENV_PROJECT_ROOT, ENV_SESSION_ID, TaskBinding, read_signal,
};
use ralph::test_support::plan_doc;

fn ralph(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ralph"))
        .current_dir(dir)
        .env("RALPH_HOME", dir.join("home"))
        .env("RUST_LOG", "off")
        .args(args)
        .output()
        .expect("spawn ralph")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

#[test]
fn validate_accepts_a_good_plan() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("plan.md"),
        plan_doc(&[("task-001", &[]), ("task-002", &["task-001"])]),
    )
    .expect("write plan");

    let out = ralph(temp.path(), &["validate"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    assert!(stdout(&out).contains("2 task(s), valid"));
}

#[test]
fn validate_rejects_unknown_dependency() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("plan.md"),
        plan_doc(&[("task-001", &["task-404"])]),
    )
    .expect("write plan");

    let out = ralph(temp.path(), &["validate"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(stdout(&out).contains("task-404"));
}

#[test]
fn missing_plan_exits_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = ralph(temp.path(), &["run", "nope.md", "--dry-run"]);
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&out.stderr).contains("error:"));
}

#[test]
fn dry_run_prints_dependency_order_without_side_effects() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("plan.md"),
        plan_doc(&[("task-002", &["task-001"]), ("task-001", &[])]),
    )
    .expect("write plan");

    let out = ralph(temp.path(), &["run", "--dry-run"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let text = stdout(&out);
    let first = text.find("task-001").expect("task-001 listed");
    let second = text.find("task-002").expect("task-002 listed");
    assert!(first < second, "wrong order:\n{text}");
    assert!(!temp.path().join(".ralph").exists());
}

#[test]
fn register_then_list_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("plan.md"), plan_doc(&[("task-001", &[])])).expect("write plan");

    let out = ralph(temp.path(), &["register"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));

    let out = ralph(temp.path(), &["registry-list", "--json"]);
    assert_eq!(out.status.code(), Some(exit_codes::OK));
    let plans: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(plans.as_array().map(Vec::len), Some(1));
    assert_eq!(plans[0]["title"], "Test Project");
    assert_eq!(plans[0]["totalTasks"], 1);
}

#[test]
fn mcp_server_writes_signal_for_bound_task() {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path();
    let mut child = Command::new(env!("CARGO_BIN_EXE_ralph"))
        .arg("mcp-server")
        .env("RUST_LOG", "off")
        .env(ENV_SESSION_ID, "session-cli")
        .env(ENV_PLAN_PATH, root.join("plan.md"))
        .env(ENV_PROJECT_ROOT, root)
        .env(ENV_CURRENT_TASK_ID, "task-003")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn mcp-server");
    {
        let mut stdin = child.stdin.take().expect("stdin");
        writeln!(
            stdin,
            r#"{{"jsonrpc":"2.0","id":1,"method":"initialize","params":{{}}}}"#
        )
        .expect("write");
        writeln!(
            stdin,
            r#"{{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{{"name":"task_complete","arguments":{{"summary":"done"}}}}}}"#
        )
        .expect("write");
    }
    let out = child.wait_with_output().expect("wait");
    assert!(out.status.success());
    assert_eq!(stdout(&out).lines().count(), 2);

    let binding = TaskBinding {
        session_id: "session-cli".into(),
        plan_path: root.join("plan.md"),
        project_root: root.to_path_buf(),
        task_id: "task-003".into(),
    };
    let signal = read_signal(&binding).expect("signal written");
    assert_eq!(signal.task_id, "task-003");
    assert_eq!(signal.summary.as_deref(), Some("done"));
}

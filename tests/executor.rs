//! Integration tests for the sandbox executor, using a stub tool binary that
//! skips the sandboxing flags and hands the command line to the host shell.
//! That exercises the real spawn, concurrent stream draining, timeout, and
//! exit code paths without needing a provisioned rootfs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use prootbox::events::OutputTap;
use prootbox::provision::EnvPaths;
use prootbox::sandbox::{ExecRequest, SandboxExecutor};

/// A stand-in for the sandbox tool: drops every argument up to `-c`, then
/// runs the remaining command line with the host shell.
const STUB_TOOL: &str = "#!/bin/sh\n\
while [ $# -gt 0 ] && [ \"$1\" != \"-c\" ]; do shift; done\n\
exec /bin/sh \"$@\"\n";

struct Harness {
    _dir: tempfile::TempDir,
    executor: SandboxExecutor,
    paths: EnvPaths,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let tool = dir.path().join("proot");
    write_executable(&tool, STUB_TOOL);

    let paths = EnvPaths::new(dir.path(), "env1");
    paths.create_directories().expect("create failed");
    fs::create_dir_all(paths.rootfs.join("bin")).expect("mkdir failed");
    fs::write(paths.rootfs.join("bin/sh"), b"").expect("write failed");

    Harness {
        executor: SandboxExecutor::new(tool, None),
        _dir: dir,
        paths,
    }
}

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).expect("write failed");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod failed");
}

#[test]
fn stdout_and_stderr_are_captured_separately() {
    let h = harness();
    let request = ExecRequest::new("echo out-line && echo err-line 1>&2");
    let result = h.executor.execute(&h.paths, &request, &OutputTap::disabled());

    assert_eq!(result.exit_code, 0);
    assert!(result.success());
    assert_eq!(result.stdout, "out-line\n");
    assert_eq!(result.stderr, "err-line\n");
}

#[test]
fn exit_code_propagates() {
    let h = harness();
    let result = h.executor.execute(
        &h.paths,
        &ExecRequest::new("exit 42"),
        &OutputTap::disabled(),
    );
    assert_eq!(result.exit_code, 42);
    assert!(!result.success());
}

#[test]
fn large_interleaved_output_does_not_deadlock() {
    // Enough data on both streams to overflow pipe buffers if either were
    // drained only after exit.
    let h = harness();
    let request = ExecRequest::new(
        "i=0; while [ $i -lt 2000 ]; do echo \"out $i\"; echo \"err $i\" 1>&2; i=$((i+1)); done",
    )
    .with_timeout(Duration::from_secs(20));
    let result = h.executor.execute(&h.paths, &request, &OutputTap::disabled());

    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout.lines().count(), 2000);
    assert_eq!(result.stderr.lines().count(), 2000);
    assert!(result.stdout.lines().last().expect("non-empty").contains("out 1999"));
}

#[test]
fn timeout_kills_and_reports_sentinel() {
    let h = harness();
    // sleep gets its streams detached so the pipes close as soon as the
    // shell itself is killed.
    let request = ExecRequest::new("echo started; sleep 30 >/dev/null 2>&1")
        .with_timeout(Duration::from_millis(300));
    let result = h.executor.execute(&h.paths, &request, &OutputTap::disabled());

    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("timed out after 300ms"), "stderr: {}", result.stderr);
    // Output produced before the kill is preserved.
    assert_eq!(result.stdout, "started\n");
    assert!(result.elapsed < Duration::from_secs(10), "kill must not wait for the command");
}

#[test]
fn live_output_reaches_the_tap_with_stream_tags() {
    let h = harness();
    let (tx, rx) = mpsc::channel();
    let request = ExecRequest::new("echo first && echo second 1>&2");
    let result = h.executor.execute(&h.paths, &request, &OutputTap::new(tx));

    assert_eq!(result.exit_code, 0);
    let lines: Vec<String> = rx.try_iter().collect();
    assert!(lines.contains(&"first".to_string()));
    assert!(lines.contains(&"[err] second".to_string()));
}

#[test]
fn missing_tool_is_reported_inline() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let paths = EnvPaths::new(dir.path(), "env1");
    let executor = SandboxExecutor::new(dir.path().join("no-such-proot"), None);

    let result = executor.execute(&paths, &ExecRequest::new("true"), &OutputTap::disabled());
    assert_eq!(result.exit_code, -1);
    assert!(result.stderr.contains("sandbox tool not found"));
}

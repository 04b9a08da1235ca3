//! Supervised execution of shell commands inside a proot sandbox.
//!
//! One invocation wraps a shell command with the userland syscall-translation
//! tool so that binaries inside an extracted rootfs run unmodified and
//! unprivileged: the tool remaps file, network, and process operations onto
//! the new root, presents UID 0 inside, and bind-mounts the host's pseudo
//! filesystems plus the application's shared storage directory.
//!
//! # Notes on stdout/stderr capture and timeouts
//!
//! Do not read stdout/stderr only after process exit: if the child writes
//! enough data to fill a pipe, the child can block forever and never exit
//! (deadlock). Both streams are drained concurrently, line by line, on two
//! independent reader threads, which also lets a live subscriber watch output
//! as it happens.
//!
//! Timeouts are enforced here with millisecond precision and a hard kill;
//! `--kill-on-exit` makes the tool take its whole child tree down with it.
//!
//! # Failure reporting
//!
//! Execution-level failures are never `Err`: a missing tool, a spawn failure,
//! and a timeout all return a normal [`ExecutionResult`] with the `-1` exit
//! code sentinel and an explanatory message, so callers can always render
//! something.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, instrument, trace, warn};

use crate::events::OutputTap;
use crate::provision::EnvPaths;
use crate::sandbox::ExecRequest;

/// Shell paths probed inside the rootfs, in preference order.
const SHELL_PREFERENCE: [&str; 5] = [
    "/bin/bash",
    "/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/sh",
    "/bin/ash",
];

/// Used when no probe matches; the most common location.
const FALLBACK_SHELL: &str = "/bin/sh";

/// Kernel release reported inside the sandbox. Spoofed because the tool's
/// probe of the real kernel's syscall-filtering facilities crashes on some
/// hosts it cannot fully emulate.
const SPOOFED_KERNEL: &str = "6.2.1";

/// Poll interval while waiting for process exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long the reader threads get to finish draining after exit or kill.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Captured outcome of one sandboxed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Accumulated standard output, line-buffered.
    pub stdout: String,
    /// Accumulated standard error, line-buffered. Failure messages (tool
    /// missing, spawn failure, timeout) are appended here.
    pub stderr: String,
    /// Exit code; `-1` means the process could not be started, timed out,
    /// or the sandbox tool is missing; the message says which.
    pub exit_code: i32,
    /// Wall-clock time spent.
    pub elapsed: Duration,
}

impl ExecutionResult {
    /// Returns true if the command exited successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Builds the `-1` sentinel result for a command that never ran to
    /// completion, carrying whatever output was accumulated so far.
    fn aborted(stdout: String, mut stderr: String, message: &str, elapsed: Duration) -> Self {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(message);
        Self {
            stdout,
            stderr,
            exit_code: -1,
            elapsed,
        }
    }
}

/// Executes shell commands inside provisioned environments via proot.
#[derive(Debug, Clone)]
pub struct SandboxExecutor {
    tool_path: PathBuf,
    shared_storage_dir: Option<PathBuf>,
}

impl SandboxExecutor {
    /// Creates an executor for the given tool binary and optional shared
    /// storage bind.
    #[must_use]
    pub fn new(tool_path: impl Into<PathBuf>, shared_storage_dir: Option<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
            shared_storage_dir,
        }
    }

    /// Runs one command inside the environment at `paths`, streaming each
    /// output line to `tap` and enforcing the request's timeout.
    #[instrument(skip(self, paths, request, tap), fields(command = %request.command, timeout_ms = %request.timeout.as_millis()))]
    pub fn execute(&self, paths: &EnvPaths, request: &ExecRequest, tap: &OutputTap) -> ExecutionResult {
        let start = Instant::now();

        if !is_executable_file(&self.tool_path) {
            let message = format!(
                "sandbox tool not found at {} (expected an executable proot binary)",
                self.tool_path.display()
            );
            warn!("{message}");
            return ExecutionResult::aborted(String::new(), String::new(), &message, start.elapsed());
        }

        let shell = resolve_shell(&paths.rootfs);
        debug!(shell, "resolved sandbox shell");

        // The tool wants its scratch directory to exist before spawn.
        let _ = fs::create_dir_all(&paths.scratch);

        let mut cmd = self.build_command(paths, request, shell);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to start sandbox process: {e}");
                warn!("{message}");
                return ExecutionResult::aborted(String::new(), String::new(), &message, start.elapsed());
            }
        };

        // Drain both streams concurrently so neither can block the other.
        let stdout_rx = spawn_line_reader(child.stdout.take(), false, tap.clone());
        let stderr_rx = spawn_line_reader(child.stderr.take(), true, tap.clone());

        // Wait for exit with millisecond precision; hard-kill on timeout.
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() > request.timeout {
                        debug!(elapsed_ms = %start.elapsed().as_millis(), "command timed out, killing process tree");
                        let _ = child.kill();
                        let _ = child.wait();
                        let stdout = drain_reader(stdout_rx);
                        let stderr = drain_reader(stderr_rx);
                        let message =
                            format!("timed out after {}ms", request.timeout.as_millis());
                        return ExecutionResult::aborted(stdout, stderr, &message, start.elapsed());
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let stdout = drain_reader(stdout_rx);
                    let stderr = drain_reader(stderr_rx);
                    let message = format!("failed to wait for sandbox process: {e}");
                    return ExecutionResult::aborted(stdout, stderr, &message, start.elapsed());
                }
            }
        };

        let stdout = drain_reader(stdout_rx);
        let stderr = drain_reader(stderr_rx);
        let exit_code = status.code().unwrap_or(-1);

        debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "command completed");
        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            elapsed: start.elapsed(),
        }
    }

    /// Assembles the full tool invocation and the fixed child environment.
    fn build_command(&self, paths: &EnvPaths, request: &ExecRequest, shell: &str) -> Command {
        let mut cmd = Command::new(&self.tool_path);
        cmd.arg("--kill-on-exit")
            // Some storage backends reject hard-link syscalls; have the tool
            // substitute symlink creation instead.
            .arg("--link2symlink")
            // Become root inside the sandbox.
            .arg("-0")
            .args(["-k", SPOOFED_KERNEL])
            .arg("-r")
            .arg(&paths.rootfs)
            .arg("-w")
            .arg(&request.working_dir)
            .args(["-b", "/dev", "-b", "/proc", "-b", "/sys"]);

        if let Some(storage) = &self.shared_storage_dir {
            // Same path inside and out, so scripts written by the host
            // application resolve unchanged.
            cmd.arg("-b").arg(storage);
        }

        cmd.arg(shell).arg("-c").arg(&request.command);

        cmd.env_clear()
            .env("HOME", "/root")
            .env(
                "PATH",
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
            )
            .env("LANG", "en_US.UTF-8")
            .env("TERM", "xterm-256color")
            .env("TMPDIR", "/tmp")
            .env("PROOT_TMP_DIR", &paths.scratch)
            // The tool's own seccomp probe crashes on some hosts.
            .env("PROOT_NO_SECCOMP", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("PIP_NO_CACHE_DIR", "1");

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

/// Probes the rootfs for a shell in preference order.
///
/// `symlink_metadata` is deliberate: shells are often symlinks whose absolute
/// targets only resolve inside the sandbox.
fn resolve_shell(rootfs: &Path) -> &'static str {
    for candidate in SHELL_PREFERENCE {
        let probe = rootfs.join(candidate.trim_start_matches('/'));
        if fs::symlink_metadata(probe).is_ok() {
            return candidate;
        }
    }
    trace!("no shell probe matched, falling back to {FALLBACK_SHELL}");
    FALLBACK_SHELL
}

fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Spawns a reader thread that forwards each line to the tap and delivers
/// the accumulated text once the stream closes.
fn spawn_line_reader<R: Read + Send + 'static>(
    stream: Option<R>,
    is_err: bool,
    tap: OutputTap,
) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let mut accumulated = String::new();
        if let Some(stream) = stream {
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                tap.line(&line, is_err);
                accumulated.push_str(&line);
                accumulated.push('\n');
            }
        }
        let _ = tx.send(accumulated);
    });
    rx
}

/// Collects a reader thread's output, bounded by the grace period. After a
/// kill the pipes close and the thread finishes promptly; if it somehow does
/// not, whatever was captured is given up rather than blocking the caller.
fn drain_reader(rx: mpsc::Receiver<String>) -> String {
    rx.recv_timeout(READER_GRACE).unwrap_or_default()
}

//! Host-side preflight checks.
//!
//! Before provisioning starts, verify that the sandbox tool binary exists and
//! is runnable, and that the directory environments live under is not on a
//! `noexec` mount (the tool cannot run binaries out of one).

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, instrument, warn};

use crate::error::ProvisionError;

/// What the preflight check learned about the sandbox tool.
#[derive(Debug, Clone)]
pub struct ToolStatus {
    pub path: PathBuf,
    /// First line of `--version` output, if the tool reported one.
    pub version: Option<String>,
}

/// Verifies the sandbox tool binary exists and is executable, and probes its
/// version string.
#[instrument]
pub fn check_tool(path: &Path) -> Result<ToolStatus, ProvisionError> {
    let executable = fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if !executable {
        return Err(ProvisionError::ToolMissing {
            path: path.to_path_buf(),
        });
    }

    let version = probe_version(path);
    debug!(?version, "sandbox tool check passed");
    Ok(ToolStatus {
        path: path.to_path_buf(),
        version,
    })
}

fn probe_version(path: &Path) -> Option<String> {
    let output = Command::new(path).arg("--version").output().ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        None
    } else {
        Some(first.to_string())
    }
}

/// Fails if `dir` sits on a filesystem mounted `noexec`.
pub fn check_exec_capable(dir: &Path) -> Result<(), ProvisionError> {
    if is_noexec_mount(dir) {
        return Err(ProvisionError::RootNotExecCapable {
            path: dir.to_path_buf(),
        });
    }
    Ok(())
}

/// Checks /proc/mounts for a `noexec` option on the mount covering `path`.
fn is_noexec_mount(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        warn!("could not read /proc/mounts, skipping noexec check");
        return false;
    };
    // The path may not exist yet; canonicalize the nearest existing ancestor.
    let resolved = canonicalize_nearest(path);
    noexec_in(&mounts, &resolved)
}

fn canonicalize_nearest(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();
    loop {
        if let Ok(resolved) = current.canonicalize() {
            return resolved;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return PathBuf::from("/"),
        }
    }
}

/// Longest-prefix match of `path` against mount points in `mounts`, then a
/// check for `noexec` among that mount's options.
fn noexec_in(mounts: &str, path: &Path) -> bool {
    let mut best: Option<(usize, bool)> = None;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount_point), Some(_fstype), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        // Octal escapes (\040 for space) only appear in exotic mount points;
        // those never cover an environments directory.
        let mount_path = Path::new(mount_point);
        if !path.starts_with(mount_path) {
            continue;
        }
        let depth = mount_point.len();
        let noexec = options.split(',').any(|opt| opt == "noexec");
        if best.map_or(true, |(d, _)| depth >= d) {
            best = Some((depth, noexec));
        }
    }
    best.map(|(_, noexec)| noexec).unwrap_or(false)
}

//! Safe extraction of gzip-compressed tar archives.
//!
//! Distribution rootfs tarballs come from the network, so every entry is
//! treated as hostile: an entry may only ever produce a path strictly inside
//! the destination tree. Entries that fail that check, or that have a kind we
//! do not materialize (hard links, devices, FIFOs), are skipped and counted,
//! never fatal. Only stream-level damage (corrupt gzip framing, truncated tar
//! headers) aborts the whole extraction, leaving partial results in place for
//! the caller to clean up.

use std::fs;
use std::io::Read;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::{debug, trace, warn};

use crate::error::ExtractError;

/// File mode applied to regular files with any execute bit in the archive.
const EXEC_MODE: u32 = 0o755;
/// File mode applied to all other regular files.
const PLAIN_MODE: u32 = 0o644;

/// Counts of what an extraction produced (and refused).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Regular files written.
    pub files: usize,
    /// Directories created.
    pub dirs: usize,
    /// Symbolic links created.
    pub symlinks: usize,
    /// Entries skipped: unsupported kinds, unreadable names, traversal
    /// attempts, failed symlink creation.
    pub skipped: usize,
}

/// Extracts a gzip-compressed tar stream into `dest`.
///
/// Preserves the executable bit on regular files and creates symbolic links
/// with their stored targets (dangling targets are fine; they resolve inside
/// the sandbox, not on the host).
///
/// # Errors
///
/// Returns [`ExtractError::Stream`] on corrupt or truncated archive data and
/// [`ExtractError::Destination`] when the destination tree itself cannot be
/// written. Per-entry problems are skips, not errors.
pub fn extract_tar_gz<R: Read>(stream: R, dest: &Path) -> Result<ExtractStats, ExtractError> {
    fs::create_dir_all(dest).map_err(|e| ExtractError::Destination {
        context: format!("failed to create destination: {}", dest.display()),
        source: e,
    })?;
    let dest_canon = dest.canonicalize().map_err(|e| ExtractError::Destination {
        context: format!("failed to canonicalize destination: {}", dest.display()),
        source: e,
    })?;

    let mut archive = Archive::new(GzDecoder::new(stream));
    let mut stats = ExtractStats::default();

    let entries = archive.entries().map_err(|e| ExtractError::Stream {
        context: "failed to open archive entry stream".to_string(),
        source: e,
    })?;

    for entry in entries {
        // A header-level read failure means the stream itself is damaged.
        let mut entry = entry.map_err(|e| ExtractError::Stream {
            context: "failed to read tar header".to_string(),
            source: e,
        })?;

        let Ok(raw_name) = entry.path().map(|p| p.into_owned()) else {
            stats.skipped += 1;
            continue;
        };
        let Some(rel) = sanitize_entry_path(&raw_name) else {
            warn!(entry = %raw_name.display(), "skipping entry that escapes the destination");
            stats.skipped += 1;
            continue;
        };
        if rel.as_os_str().is_empty() {
            // "." or "./" entries describe the destination itself.
            continue;
        }
        let target = dest_canon.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                if !parent_stays_inside(&target, &dest_canon) {
                    warn!(entry = %rel.display(), "skipping directory whose parent resolves outside the destination");
                    stats.skipped += 1;
                    continue;
                }
                fs::create_dir_all(&target).map_err(|e| ExtractError::Destination {
                    context: format!("failed to create directory: {}", target.display()),
                    source: e,
                })?;
                stats.dirs += 1;
            }
            EntryType::Symlink => {
                match entry.link_name() {
                    Ok(Some(link)) if parent_stays_inside(&target, &dest_canon) => {
                        // Creation failures (dangling, unsupported fs) are non-fatal.
                        if std::os::unix::fs::symlink(&link, &target).is_ok() {
                            stats.symlinks += 1;
                        } else {
                            trace!(target = %target.display(), "symlink creation failed, skipping");
                            stats.skipped += 1;
                        }
                    }
                    _ => stats.skipped += 1,
                }
            }
            t if t.is_file() => {
                if !parent_stays_inside(&target, &dest_canon) {
                    warn!(entry = %rel.display(), "skipping file whose parent resolves outside the destination");
                    stats.skipped += 1;
                    continue;
                }
                let mut file = fs::File::create(&target).map_err(|e| ExtractError::Destination {
                    context: format!("failed to create file: {}", target.display()),
                    source: e,
                })?;
                // Truncation mid-entry surfaces here as a stream error.
                std::io::copy(&mut entry, &mut file).map_err(|e| ExtractError::Stream {
                    context: format!("truncated entry data for: {}", rel.display()),
                    source: e,
                })?;

                let stored_mode = entry.header().mode().unwrap_or(PLAIN_MODE);
                let mode = if stored_mode & 0o111 != 0 {
                    EXEC_MODE
                } else {
                    PLAIN_MODE
                };
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
                stats.files += 1;
            }
            other => {
                trace!(kind = ?other, entry = %rel.display(), "skipping unsupported entry kind");
                stats.skipped += 1;
            }
        }
    }

    debug!(
        files = stats.files,
        dirs = stats.dirs,
        symlinks = stats.symlinks,
        skipped = stats.skipped,
        "extraction complete"
    );
    Ok(stats)
}

/// Normalizes a tar entry name into a relative path that cannot leave the
/// destination: leading `./` stripped, only plain components kept.
///
/// Returns `None` for names containing `..`, a root, or a prefix component;
/// returns an empty path for `.`-only names.
fn sanitize_entry_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => clean.push(part),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

/// Ensures the (created) parent of `target` still canonicalizes under the
/// destination. Defends against archives that first plant a symlinked
/// directory and then write through it.
fn parent_stays_inside(target: &Path, dest_canon: &Path) -> bool {
    let Some(parent) = target.parent() else {
        return false;
    };
    if fs::create_dir_all(parent).is_err() {
        return false;
    }
    match parent.canonicalize() {
        Ok(canon) => canon.starts_with(dest_canon),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_leading_dot() {
        let clean = sanitize_entry_path(Path::new("./bin/sh")).expect("should be accepted");
        assert_eq!(clean, PathBuf::from("bin/sh"));
    }

    #[test]
    fn test_sanitize_rejects_parent_components() {
        assert!(sanitize_entry_path(Path::new("../escape")).is_none());
        assert!(sanitize_entry_path(Path::new("a/../../escape")).is_none());
    }

    #[test]
    fn test_sanitize_rejects_absolute_paths() {
        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_none());
    }

    #[test]
    fn test_sanitize_dot_only_is_empty() {
        let clean = sanitize_entry_path(Path::new("./")).expect("should be accepted");
        assert!(clean.as_os_str().is_empty());
    }
}

//! Filesystem layout and catalog of provisioned environments.
//!
//! The registry is deliberately thin: "installed" is derived by probing for
//! a shell inside the rootfs at the two conventional install locations, not
//! read from any stored state. That makes it self-healing after a crash
//! mid-provisioning: a tree without its shell is simply reported as not
//! installed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument, trace};
use walkdir::WalkDir;

use crate::error::RegistryError;
use crate::provision::EnvMetadata;

/// Directory permissions for environment roots: owner only (0700).
const DIR_PERMISSIONS: u32 = 0o700;

/// Shell locations probed (relative to the rootfs) to decide whether an
/// environment is usable.
const SHELL_PROBES: [&str; 2] = ["bin/sh", "usr/bin/sh"];

/// Paths for one environment's on-disk structure.
///
/// ```text
/// {base_dir}/{env-id}/
/// ├── rootfs/          # extracted tree (sandbox /)
/// ├── tmp/             # sandbox tool scratch directory
/// ├── meta.json        # advisory metadata
/// └── rootfs.tar.gz    # transient download artifact
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvPaths {
    /// Root directory for this environment.
    pub root: PathBuf,
    /// Extracted filesystem tree; becomes the sandbox's `/`.
    pub rootfs: PathBuf,
    /// Private scratch directory handed to the sandbox tool.
    pub scratch: PathBuf,
    /// Advisory metadata JSON file.
    pub meta_file: PathBuf,
    /// Download artifact; exists only while provisioning.
    pub archive: PathBuf,
}

impl EnvPaths {
    /// Computes the paths for an environment. Does not touch the filesystem.
    #[must_use]
    pub fn new(base_dir: &Path, id: &str) -> Self {
        let root = base_dir.join(id);
        Self {
            rootfs: root.join("rootfs"),
            scratch: root.join("tmp"),
            meta_file: root.join("meta.json"),
            archive: root.join("rootfs.tar.gz"),
            root,
        }
    }

    /// Creates the root and scratch directories with restricted permissions.
    /// The rootfs directory is created by extraction.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if directory creation fails.
    pub fn create_directories(&self) -> Result<(), RegistryError> {
        for dir in [&self.root, &self.scratch] {
            fs::create_dir_all(dir).map_err(|e| RegistryError::Io {
                context: format!("failed to create directory: {}", dir.display()),
                source: e,
            })?;
        }
        let permissions = fs::Permissions::from_mode(DIR_PERMISSIONS);
        fs::set_permissions(&self.root, permissions).map_err(|e| RegistryError::Io {
            context: format!("failed to set permissions on: {}", self.root.display()),
            source: e,
        })?;
        Ok(())
    }

    /// Returns true if this environment's directory exists at all.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Probes for a shell inside the rootfs.
    ///
    /// Uses `symlink_metadata` rather than `exists`: `bin/sh` is typically a
    /// symlink with an absolute target that only resolves inside the sandbox,
    /// so following it on the host would give a false negative.
    #[must_use]
    pub fn has_shell(&self) -> bool {
        SHELL_PROBES
            .iter()
            .any(|probe| fs::symlink_metadata(self.rootfs.join(probe)).is_ok())
    }
}

/// An entry in the environment catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    /// Environment identifier (directory name).
    pub id: String,
    /// Absolute path of the rootfs tree.
    pub path: PathBuf,
    /// Whether the rootfs passed the shell probe.
    pub installed: bool,
}

/// Catalog of environments under one provisioning root.
#[derive(Debug, Clone)]
pub struct Registry {
    base_dir: PathBuf,
}

impl Registry {
    /// Creates a registry over the given provisioning root.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the provisioning root.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Computes the on-disk paths for an environment id.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::InvalidId` for ids that would escape the
    /// provisioning root.
    pub fn paths(&self, id: &str) -> Result<EnvPaths, RegistryError> {
        validate_id(id)?;
        Ok(EnvPaths::new(&self.base_dir, id))
    }

    /// Returns true if the environment has a usable rootfs.
    #[must_use]
    pub fn exists(&self, id: &str) -> bool {
        match self.paths(id) {
            Ok(paths) => paths.has_shell(),
            Err(_) => false,
        }
    }

    /// Enumerates environments by scanning the provisioning root.
    ///
    /// Every direct subdirectory is reported; `installed` reflects the shell
    /// probe so half-provisioned leftovers are visible but marked unusable.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if the scan fails.
    #[instrument(skip(self), fields(base_dir = %self.base_dir.display()))]
    pub fn list(&self) -> Result<Vec<EnvEntry>, RegistryError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(&self.base_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path == self.base_dir || !path.is_dir() {
                continue;
            }
            let Some(id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let paths = EnvPaths::new(&self.base_dir, id);
            let installed = paths.has_shell();
            entries.push(EnvEntry {
                id: id.to_string(),
                path: paths.rootfs,
                installed,
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        trace!(count = entries.len(), "registry scan complete");
        Ok(entries)
    }

    /// Loads the advisory metadata for an environment, if readable.
    #[must_use]
    pub fn load_metadata(&self, id: &str) -> Option<EnvMetadata> {
        let paths = self.paths(id).ok()?;
        EnvMetadata::load(&paths.meta_file).ok()
    }

    /// Recursively removes an environment's tree.
    ///
    /// Returns `true` if something was removed; deleting an absent
    /// environment is a no-op returning `false`.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if removal fails partway.
    #[instrument(skip(self))]
    pub fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let paths = self.paths(id)?;
        if !paths.exists() {
            debug!(id, "environment already absent, nothing to delete");
            return Ok(false);
        }

        fs::remove_dir_all(&paths.root).map_err(|e| RegistryError::Io {
            context: format!("failed to remove environment tree: {}", paths.root.display()),
            source: e,
        })?;
        debug!(id, "environment deleted");
        Ok(true)
    }
}

/// Rejects ids that are empty or contain path separators or `..`.
fn validate_id(id: &str) -> Result<(), RegistryError> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0');
    if bad {
        return Err(RegistryError::InvalidId { id: id.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (tempfile::TempDir, Registry) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let registry = Registry::new(dir.path());
        (dir, registry)
    }

    /// Plants a minimal fake rootfs with a shell at `bin/sh`.
    fn plant_rootfs(registry: &Registry, id: &str) -> EnvPaths {
        let paths = registry.paths(id).expect("paths failed");
        fs::create_dir_all(paths.rootfs.join("bin")).expect("mkdir failed");
        fs::write(paths.rootfs.join("bin/sh"), b"#!/bin/sh\n").expect("write failed");
        paths
    }

    #[test]
    fn test_validate_id_rejects_traversal() {
        assert!(validate_id("../escape").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("").is_err());
        assert!(validate_id("ok-env_1").is_ok());
    }

    #[test]
    fn test_exists_requires_shell() {
        let (_dir, registry) = test_registry();
        let paths = registry.paths("e1").expect("paths failed");
        fs::create_dir_all(&paths.rootfs).expect("mkdir failed");

        // A tree without a shell is not installed.
        assert!(!registry.exists("e1"));

        fs::create_dir_all(paths.rootfs.join("bin")).expect("mkdir failed");
        fs::write(paths.rootfs.join("bin/sh"), b"").expect("write failed");
        assert!(registry.exists("e1"));
    }

    #[test]
    fn test_dangling_shell_symlink_counts() {
        let (_dir, registry) = test_registry();
        let paths = registry.paths("e1").expect("paths failed");
        fs::create_dir_all(paths.rootfs.join("bin")).expect("mkdir failed");
        // Absolute target resolves only inside the sandbox; dangling on the host.
        std::os::unix::fs::symlink("/bin/busybox", paths.rootfs.join("bin/sh"))
            .expect("symlink failed");

        assert!(registry.exists("e1"));
    }

    #[test]
    fn test_list_reports_installed_state() {
        let (_dir, registry) = test_registry();
        plant_rootfs(&registry, "ready");
        let partial = registry.paths("partial").expect("paths failed");
        fs::create_dir_all(&partial.rootfs).expect("mkdir failed");

        let entries = registry.list().expect("list failed");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "partial");
        assert!(!entries[0].installed);
        assert_eq!(entries[1].id, "ready");
        assert!(entries[1].installed);
    }

    #[test]
    fn test_list_on_missing_base_dir_is_empty() {
        let registry = Registry::new("/nonexistent/prootbox-test-base");
        assert!(registry.list().expect("list failed").is_empty());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (_dir, registry) = test_registry();
        let paths = plant_rootfs(&registry, "e1");
        assert!(paths.root.exists());

        assert!(registry.delete("e1").expect("first delete failed"));
        assert!(!paths.root.exists());
        assert!(!registry.delete("e1").expect("second delete failed"));
    }
}

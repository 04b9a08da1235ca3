//! Advisory on-disk metadata for environments.
//!
//! Persisted as `meta.json` next to the rootfs, carrying only what the tree
//! cannot express: which distribution it came from and when it reached each
//! state. It is never consulted to decide whether an environment is
//! installed (the shell probe decides that), so a missing or corrupt file
//! never makes a usable rootfs unusable.

use std::fs;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::provision::{Distribution, EnvStatus};

/// Metadata for one environment, persisted to disk as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvMetadata {
    /// Environment identifier.
    pub id: String,

    /// Distribution the rootfs came from.
    pub distribution: Distribution,

    /// Status at the time of the last save.
    pub status: EnvStatus,

    /// When provisioning started.
    pub created_at: DateTime<Utc>,

    /// Set only on the transition into `Ready`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<DateTime<Utc>>,

    /// Set only in `Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl EnvMetadata {
    /// Creates metadata for a freshly requested environment.
    #[must_use]
    pub fn new(id: impl Into<String>, distribution: Distribution) -> Self {
        Self {
            id: id.into(),
            distribution,
            status: EnvStatus::Uninitialized,
            created_at: Utc::now(),
            installed_at: None,
            error_message: None,
        }
    }

    /// Loads metadata from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if reading or parsing fails.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = fs::read_to_string(path).map_err(|e| RegistryError::Io {
            context: format!("failed to read metadata file: {}", path.display()),
            source: e,
        })?;

        serde_json::from_str(&content).map_err(|e| RegistryError::Io {
            context: format!("failed to parse metadata JSON: {}", path.display()),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Saves metadata to a JSON file atomically.
    ///
    /// Writes to a temporary file first, then renames to the target path so
    /// a crash mid-write cannot corrupt existing metadata.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Io` if writing fails.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let json = serde_json::to_string_pretty(self).map_err(|e| RegistryError::Io {
            context: "failed to serialize metadata".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        let temp_path = path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).map_err(|e| RegistryError::Io {
            context: format!("failed to create temp metadata file: {}", temp_path.display()),
            source: e,
        })?;
        file.write_all(json.as_bytes())
            .map_err(|e| RegistryError::Io {
                context: format!("failed to write metadata: {}", temp_path.display()),
                source: e,
            })?;
        file.sync_all().map_err(|e| RegistryError::Io {
            context: "failed to sync metadata file".to_string(),
            source: e,
        })?;

        fs::rename(&temp_path, path).map_err(|e| RegistryError::Io {
            context: format!(
                "failed to rename temp file {} to {}",
                temp_path.display(),
                path.display()
            ),
            source: e,
        })
    }

    /// Records a non-terminal pipeline state.
    pub fn set_status(&mut self, status: EnvStatus) {
        self.status = status;
    }

    /// Marks the environment ready, stamping the install time.
    pub fn set_ready(&mut self) {
        self.status = EnvStatus::Ready;
        self.installed_at = Some(Utc::now());
        self.error_message = None;
    }

    /// Marks the environment failed with the given message.
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.status = EnvStatus::Error;
        self.error_message = Some(message.into());
    }

    /// Marks the environment cancelled.
    pub fn set_cancelled(&mut self) {
        self.status = EnvStatus::Cancelled;
        self.error_message = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_new_is_uninitialized() {
        let meta = EnvMetadata::new("e1", Distribution::Alpine);
        assert_eq!(meta.status, EnvStatus::Uninitialized);
        assert!(meta.installed_at.is_none());
        assert!(meta.error_message.is_none());
    }

    #[test]
    fn test_metadata_save_load_roundtrip() {
        let mut meta = EnvMetadata::new("e1", Distribution::Ubuntu);
        meta.set_ready();

        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("meta.json");

        meta.save(&path).expect("failed to save metadata");
        let loaded = EnvMetadata::load(&path).expect("failed to load metadata");

        assert_eq!(loaded.id, "e1");
        assert_eq!(loaded.distribution, Distribution::Ubuntu);
        assert_eq!(loaded.status, EnvStatus::Ready);
        assert_eq!(loaded.installed_at, meta.installed_at);
    }

    #[test]
    fn test_ready_clears_error_and_stamps_time() {
        let mut meta = EnvMetadata::new("e1", Distribution::Alpine);
        meta.set_error("download failed");
        assert_eq!(meta.status, EnvStatus::Error);
        assert!(meta.error_message.is_some());

        meta.set_ready();
        assert_eq!(meta.status, EnvStatus::Ready);
        assert!(meta.installed_at.is_some());
        assert!(meta.error_message.is_none());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("meta.json");
        fs::write(&path, "not json").expect("write failed");

        assert!(EnvMetadata::load(&path).is_err());
    }
}

//! The external surface: install, inspect, execute, delete.
//!
//! [`SandboxService`] owns the registry, the executor, and the set of
//! in-flight installations. Installations run on background threads and
//! report through per-run cancellation tokens plus the service-wide progress
//! and output subscriptions; everything else is synchronous.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, instrument, warn};

use crate::error::{Error, ProvisionError, Result};
use crate::events::{OutputTap, ProgressEvent, ProgressReporter, RunToken};
use crate::provision::{Distribution, EnvEntry, Environment, ProvisionConfig, Provisioner, Registry};
use crate::sandbox::{ExecRequest, ExecutionResult, SandboxExecutor};

/// Handle to one background installation.
///
/// Dropping the handle does not stop the run; call [`InstallHandle::cancel`]
/// or the service-wide [`SandboxService::cancel_setup`] for that.
#[derive(Debug)]
pub struct InstallHandle {
    outcome: Receiver<std::result::Result<Environment, ProvisionError>>,
    token: RunToken,
}

impl InstallHandle {
    /// Blocks until the installation finishes and returns its outcome.
    pub fn wait(self) -> std::result::Result<Environment, ProvisionError> {
        self.outcome
            .recv()
            .unwrap_or_else(|_| {
                Err(ProvisionError::Internal {
                    message: "installation thread exited without reporting".to_string(),
                })
            })
    }

    /// The run's cancellation token; clone it to cancel from elsewhere.
    #[must_use]
    pub fn token(&self) -> RunToken {
        self.token.clone()
    }

    /// Requests cooperative cancellation of this installation.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

/// Provisioning and execution service over one environments directory.
pub struct SandboxService {
    config: ProvisionConfig,
    registry: Registry,
    executor: SandboxExecutor,
    provisioner: Provisioner,
    progress_tx: Mutex<Option<Sender<ProgressEvent>>>,
    output_tx: Mutex<Option<Sender<String>>>,
    active: Arc<Mutex<HashMap<String, RunToken>>>,
}

impl SandboxService {
    /// Creates a service over the given configuration.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        let registry = Registry::new(config.base_dir.clone());
        let executor = SandboxExecutor::new(
            config.tool_path.clone(),
            config.shared_storage_dir.clone(),
        );
        let provisioner = Provisioner::new(config.clone());
        Self {
            config,
            registry,
            executor,
            provisioner,
            progress_tx: Mutex::new(None),
            output_tx: Mutex::new(None),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Subscribes to progress events from subsequent installations.
    ///
    /// Replaces any previous subscription; a run already in flight keeps
    /// reporting to the sender it started with.
    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = mpsc::channel();
        *self.progress_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Subscribes to live output lines from bootstrap and execute commands.
    ///
    /// Replaces any previous subscription. Stderr lines carry an `[err] `
    /// prefix.
    pub fn subscribe_output(&self) -> Receiver<String> {
        let (tx, rx) = mpsc::channel();
        *self.output_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Starts installing an environment on a background thread.
    ///
    /// A second install for an id already in flight is refused; the returned
    /// handle reports [`ProvisionError::AlreadyRunning`] immediately.
    #[instrument(skip(self), fields(distribution = %distribution))]
    pub fn install_environment(&self, distribution: Distribution, env_id: &str) -> InstallHandle {
        let token = RunToken::new();
        let (tx, rx) = mpsc::channel();

        {
            let mut active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if active.contains_key(env_id) {
                let _ = tx.send(Err(ProvisionError::AlreadyRunning {
                    id: env_id.to_string(),
                }));
                return InstallHandle { outcome: rx, token };
            }
            active.insert(env_id.to_string(), token.clone());
        }

        // Snapshot the current subscriptions; each run gets a fresh reporter
        // so the monotonic high-water mark resets per installation.
        let progress = match self.progress_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            Some(sender) => ProgressReporter::new(sender),
            None => ProgressReporter::disabled(),
        };
        let tap = match self.output_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            Some(sender) => OutputTap::new(sender),
            None => OutputTap::disabled(),
        };

        let provisioner = self.provisioner.clone();
        let active = Arc::clone(&self.active);
        let id = env_id.to_string();
        let run_token = token.clone();
        let builder = thread::Builder::new().name(format!("install-{id}"));
        let spawned = builder.spawn(move || {
            info!(id, "installation started");
            let outcome = provisioner.provision(&id, distribution, &run_token, &progress, &tap);
            active.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(&id);
            if let Err(e) = &outcome {
                warn!(id, error = %e, "installation did not complete");
            }
            let _ = tx.send(outcome);
        });
        if let Err(e) = spawned {
            // tx moved into the closure that never ran; the receiver sees a
            // disconnect and wait() maps it to an internal error.
            warn!(error = %e, "could not spawn installation thread");
            self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(env_id);
        }

        InstallHandle { outcome: rx, token }
    }

    /// Requests cooperative cancellation of every in-flight installation.
    pub fn cancel_setup(&self) {
        let active = self.active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        debug!(count = active.len(), "cancelling active installations");
        for token in active.values() {
            token.cancel();
        }
    }

    /// Whether the environment is installed: its rootfs contains a shell.
    #[must_use]
    pub fn is_installed(&self, env_id: &str) -> bool {
        self.registry.exists(env_id)
    }

    /// Lists known environments with their derived installed state.
    pub fn list_environments(&self) -> Result<Vec<EnvEntry>> {
        Ok(self.registry.list()?)
    }

    /// Deletes an environment's directory tree. Returns false if nothing
    /// existed to delete.
    pub fn delete_environment(&self, env_id: &str) -> Result<bool> {
        Ok(self.registry.delete(env_id)?)
    }

    /// Runs one shell command inside an installed environment.
    ///
    /// Never fails at the API level: a missing environment, a missing tool,
    /// a spawn failure, and a timeout all come back as a result with exit
    /// code `-1` and an explanatory message in `stderr`.
    #[instrument(skip(self, request), fields(command = %request.command))]
    pub fn execute(&self, env_id: &str, request: &ExecRequest) -> ExecutionResult {
        let paths = match self.registry.paths(env_id) {
            Ok(paths) if paths.has_shell() => paths,
            Ok(_) | Err(_) => {
                return ExecutionResult {
                    stdout: String::new(),
                    stderr: format!("environment {env_id} is not installed"),
                    exit_code: -1,
                    elapsed: std::time::Duration::ZERO,
                };
            }
        };

        let tap = match self.output_tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone() {
            Some(sender) => OutputTap::new(sender),
            None => OutputTap::disabled(),
        };
        self.executor.execute(&paths, request, &tap)
    }

    /// Copies a file into the shared storage directory visible inside every
    /// sandbox, returning its destination path.
    pub fn save_artifact_to_shared_storage(
        &self,
        source: &Path,
        file_name: &str,
    ) -> Result<PathBuf> {
        let Some(storage) = &self.config.shared_storage_dir else {
            return Err(Error::Provision(ProvisionError::Internal {
                message: "no shared storage directory configured".to_string(),
            }));
        };
        fs::create_dir_all(storage).map_err(Error::Io)?;
        let dest = storage.join(file_name);
        fs::copy(source, &dest).map_err(Error::Io)?;
        debug!(dest = %dest.display(), "artifact saved to shared storage");
        Ok(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_in(dir: &Path) -> SandboxService {
        SandboxService::new(
            ProvisionConfig::default()
                .with_base_dir(dir.join("envs"))
                .with_tool_path("/nonexistent/proot"),
        )
    }

    #[test]
    fn test_execute_on_missing_environment_is_sentinel() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let service = service_in(dir.path());

        let result = service.execute("ghost", &ExecRequest::new("echo hi"));
        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("ghost is not installed"));
    }

    #[test]
    fn test_duplicate_install_refused() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let service = service_in(dir.path());
        service
            .active
            .lock()
            .expect("lock")
            .insert("env1".to_string(), RunToken::new());

        let handle = service.install_environment(Distribution::Alpine, "env1");
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyRunning { .. }));
    }

    #[test]
    fn test_cancel_setup_flips_every_active_token() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let service = service_in(dir.path());
        let t1 = RunToken::new();
        let t2 = RunToken::new();
        {
            let mut active = service.active.lock().expect("lock");
            active.insert("a".to_string(), t1.clone());
            active.insert("b".to_string(), t2.clone());
        }

        service.cancel_setup();
        assert!(t1.is_cancelled());
        assert!(t2.is_cancelled());
    }

    #[test]
    fn test_shared_storage_unconfigured_is_error() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let service = service_in(dir.path());
        let source = dir.path().join("artifact.txt");
        fs::write(&source, b"payload").expect("write failed");

        let err = service
            .save_artifact_to_shared_storage(&source, "artifact.txt")
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Provision(ProvisionError::Internal { .. })
        ));
    }

    #[test]
    fn test_shared_storage_copy() {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let storage = dir.path().join("shared");
        let service = SandboxService::new(
            ProvisionConfig::default()
                .with_base_dir(dir.path().join("envs"))
                .with_tool_path("/nonexistent/proot")
                .with_shared_storage(&storage),
        );
        let source = dir.path().join("artifact.txt");
        fs::write(&source, b"payload").expect("write failed");

        let dest = service
            .save_artifact_to_shared_storage(&source, "artifact.txt")
            .expect("copy failed");
        assert_eq!(dest, storage.join("artifact.txt"));
        assert_eq!(fs::read(dest).expect("read failed"), b"payload");
    }
}

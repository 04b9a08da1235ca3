//! The provisioning pipeline: preflight, download, extract, configure,
//! bootstrap.
//!
//! One [`Provisioner::provision`] call drives an environment from nothing to
//! `Ready`, emitting stage-tagged progress along a monotonic fraction
//! schedule and checking the run's cancellation token at every stage
//! boundary. Metadata saves are advisory best-effort: an unwritable
//! `meta.json` never fails a run that produced a working rootfs.

use std::fs::{self, File};
use std::path::Path;

use tracing::{debug, info, instrument, warn};

use crate::error::{FetchError, ProvisionError};
use crate::events::{OutputTap, ProgressReporter, RunToken};
use crate::provision::{
    extract_tar_gz, fetch_first_available, Distribution, EnvMetadata, EnvPaths, EnvStatus,
    Environment, ProvisionConfig, Registry,
};
use crate::sandbox::{ExecRequest, SandboxExecutor};
use crate::system;

/// Progress fraction checkpoints. Downloading owns the widest band because it
/// dominates wall-clock time on most connections.
const FRACTION_PREFLIGHT: f32 = 0.03;
const FRACTION_DIRS_READY: f32 = 0.06;
const FRACTION_DOWNLOAD: (f32, f32) = (0.10, 0.60);
const FRACTION_EXTRACTED: f32 = 0.75;
const FRACTION_CONFIGURING: f32 = 0.76;
const FRACTION_CONFIGURED: f32 = 0.78;
const FRACTION_BOOTSTRAP: f32 = 0.80;
const FRACTION_UPGRADE: f32 = 0.92;

/// DNS servers written into the rootfs; extracted archives ship an empty
/// resolver configuration.
const RESOLV_CONF: &str = "nameserver 8.8.8.8\nnameserver 1.1.1.1\n";

/// Drives the full provisioning pipeline for one environment.
#[derive(Debug, Clone)]
pub struct Provisioner {
    config: ProvisionConfig,
    registry: Registry,
    executor: SandboxExecutor,
}

impl Provisioner {
    /// Creates a provisioner over the given configuration.
    #[must_use]
    pub fn new(config: ProvisionConfig) -> Self {
        let registry = Registry::new(config.base_dir.clone());
        let executor = SandboxExecutor::new(
            config.tool_path.clone(),
            config.shared_storage_dir.clone(),
        );
        Self {
            config,
            registry,
            executor,
        }
    }

    /// Provisions environment `id` from scratch.
    ///
    /// Emits progress on `progress`, streams bootstrap command output on
    /// `tap`, and aborts cooperatively when `token` is cancelled. On failure
    /// or cancellation the terminal state is recorded in the environment's
    /// metadata before the error propagates.
    #[instrument(skip(self, token, progress, tap), fields(distribution = %distribution))]
    pub fn provision(
        &self,
        id: &str,
        distribution: Distribution,
        token: &RunToken,
        progress: &ProgressReporter,
        tap: &OutputTap,
    ) -> Result<Environment, ProvisionError> {
        let paths = self
            .registry
            .paths(id)
            .map_err(|e| ProvisionError::Internal {
                message: e.to_string(),
            })?;
        let mut meta = EnvMetadata::new(id, distribution);

        match self.run(&paths, &mut meta, distribution, token, progress, tap) {
            Ok(env) => Ok(env),
            Err(e) => {
                if matches!(e, ProvisionError::Cancelled) {
                    meta.set_cancelled();
                } else {
                    meta.set_error(e.to_string());
                }
                save_meta(&meta, &paths);
                Err(e)
            }
        }
    }

    fn run(
        &self,
        paths: &EnvPaths,
        meta: &mut EnvMetadata,
        distribution: Distribution,
        token: &RunToken,
        progress: &ProgressReporter,
        tap: &OutputTap,
    ) -> Result<Environment, ProvisionError> {
        progress.emit("Verifying sandbox tool", FRACTION_PREFLIGHT);
        let tool = system::check_tool(&self.config.tool_path)?;
        if let Some(version) = &tool.version {
            progress.info(format!("Sandbox tool: {version}"));
        }
        system::check_exec_capable(&self.config.base_dir)?;

        paths
            .create_directories()
            .map_err(|e| ProvisionError::Internal {
                message: e.to_string(),
            })?;
        progress.emit("Preparing environment directories", FRACTION_DIRS_READY);
        check_cancelled(token, paths, meta)?;

        meta.set_status(EnvStatus::Downloading);
        save_meta(meta, paths);
        let sources = self
            .config
            .sources_override
            .clone()
            .unwrap_or_else(|| distribution.rootfs_sources());
        let agent = crate::provision::rootfs_agent();
        fetch_first_available(
            &agent,
            &sources,
            &paths.archive,
            progress,
            FRACTION_DOWNLOAD,
            token,
        )
        .map_err(|e| match e {
            FetchError::Cancelled => ProvisionError::Cancelled,
            other => ProvisionError::DownloadFailed(other),
        })?;
        check_cancelled(token, paths, meta)?;

        meta.set_status(EnvStatus::Extracting);
        save_meta(meta, paths);
        progress.emit("Extracting root filesystem", FRACTION_DOWNLOAD.1);
        let archive = File::open(&paths.archive).map_err(|e| ProvisionError::Io {
            context: format!("opening downloaded archive {}", paths.archive.display()),
            source: e,
        })?;
        let stats = extract_tar_gz(archive, &paths.rootfs)?;
        if let Err(e) = fs::remove_file(&paths.archive) {
            warn!(error = %e, "could not remove downloaded archive");
        }
        progress.emit(
            format!("Extracted {} files", stats.files),
            FRACTION_EXTRACTED,
        );
        debug!(?stats, "rootfs extraction finished");
        check_cancelled(token, paths, meta)?;

        meta.set_status(EnvStatus::Configuring);
        save_meta(meta, paths);
        progress.emit("Configuring base system", FRACTION_CONFIGURING);
        write_resolv_conf(&paths.rootfs);
        progress.emit("Base system configured", FRACTION_CONFIGURED);
        check_cancelled(token, paths, meta)?;

        meta.set_status(EnvStatus::InstallingRuntime);
        save_meta(meta, paths);
        progress.emit("Installing language runtime", FRACTION_BOOTSTRAP);
        self.bootstrap(paths, distribution.bootstrap_command(), tap);
        check_cancelled(token, paths, meta)?;

        progress.emit("Upgrading package tooling", FRACTION_UPGRADE);
        self.bootstrap(paths, distribution.upgrade_command(), tap);
        check_cancelled(token, paths, meta)?;

        meta.set_ready();
        save_meta(meta, paths);
        progress.emit("Environment ready", 1.0);
        info!("environment provisioned");

        Ok(Environment {
            id: meta.id.clone(),
            distribution,
            root_path: paths.rootfs.clone(),
            status: EnvStatus::Ready,
            installed_at: meta.installed_at,
            error_message: None,
        })
    }

    /// Runs one in-sandbox bootstrap command. A failing bootstrap leaves an
    /// environment that can still run shell commands, so non-zero exit is a
    /// warning, not a pipeline failure.
    fn bootstrap(&self, paths: &EnvPaths, command: &str, tap: &OutputTap) {
        let request = ExecRequest::new(command).with_timeout(self.config.bootstrap_timeout);
        let result = self.executor.execute(paths, &request, tap);
        if !result.success() {
            warn!(
                exit_code = result.exit_code,
                command, "bootstrap command failed, continuing without it"
            );
        }
    }
}

/// Cancellation boundary: persists the terminal state and cleans up the
/// transient archive so a later re-install starts clean.
fn check_cancelled(
    token: &RunToken,
    paths: &EnvPaths,
    meta: &mut EnvMetadata,
) -> Result<(), ProvisionError> {
    if !token.is_cancelled() {
        return Ok(());
    }
    let _ = fs::remove_file(&paths.archive);
    meta.set_cancelled();
    save_meta(meta, paths);
    Err(ProvisionError::Cancelled)
}

fn save_meta(meta: &EnvMetadata, paths: &EnvPaths) {
    if let Err(e) = meta.save(&paths.meta_file) {
        warn!(error = %e, "could not persist environment metadata");
    }
}

/// Writes a working DNS configuration into the rootfs. Best-effort: an odd
/// archive layout should not abort provisioning this late.
fn write_resolv_conf(rootfs: &Path) {
    let etc = rootfs.join("etc");
    if let Err(e) = fs::create_dir_all(&etc) {
        warn!(error = %e, "could not create etc directory in rootfs");
        return;
    }
    // resolv.conf is frequently a dangling symlink to a resolver daemon's
    // runtime file; replace it outright.
    let target = etc.join("resolv.conf");
    let _ = fs::remove_file(&target);
    if let Err(e) = fs::write(&target, RESOLV_CONF) {
        warn!(error = %e, "could not write resolv.conf in rootfs");
    }
}

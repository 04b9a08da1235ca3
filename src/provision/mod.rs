//! Environment provisioning: rootfs acquisition, extraction, and lifecycle.
//!
//! Each environment is one extracted Linux root filesystem plus a little
//! bookkeeping, stored under the provisioning root:
//!
//! ```text
//! {base_dir}/{env-id}/
//! ├── rootfs/          # extracted tree, becomes the sandbox's /
//! ├── tmp/             # private scratch dir handed to the sandbox tool
//! ├── meta.json        # advisory metadata (distribution, timestamps)
//! └── rootfs.tar.gz    # transient download artifact, removed after extract
//! ```
//!
//! "Installed" is always DERIVED by probing for a shell inside `rootfs/`,
//! never read from `meta.json`; an environment that lost its shell mid-crash
//! is simply reported as not installed and can be re-provisioned. Metadata
//! only carries what the tree cannot: the distribution and timestamps.

mod extract;
mod fetch;
mod meta;
mod pipeline;
mod registry;

pub use extract::{ExtractStats, extract_tar_gz};
pub use fetch::{fetch_first_available, rootfs_agent};
pub use meta::EnvMetadata;
pub use pipeline::Provisioner;
pub use registry::{EnvEntry, EnvPaths, Registry};

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Linux distribution a rootfs can be provisioned from.
///
/// Selects both the ordered rootfs source list and the in-sandbox bootstrap
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distribution {
    /// Alpine minirootfs (musl, apk).
    Alpine,
    /// Ubuntu Base (glibc, apt).
    Ubuntu,
}

/// Pinned Alpine release used for the default source list.
const ALPINE_BRANCH: &str = "v3.20";
const ALPINE_RELEASE: &str = "3.20.3";

/// Pinned Ubuntu Base release used for the default source list.
const UBUNTU_SERIES: &str = "24.04";
const UBUNTU_RELEASE: &str = "24.04.1";

impl Distribution {
    /// Stable lowercase name, used in CLI arguments and metadata.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alpine => "alpine",
            Self::Ubuntu => "ubuntu",
        }
    }

    /// Ordered candidate URLs for this distribution's rootfs archive,
    /// primary CDN first, mirrors after.
    #[must_use]
    pub fn rootfs_sources(&self) -> Vec<String> {
        match self {
            Self::Alpine => {
                let arch = alpine_arch();
                let tail = format!(
                    "alpine/{ALPINE_BRANCH}/releases/{arch}/alpine-minirootfs-{ALPINE_RELEASE}-{arch}.tar.gz"
                );
                vec![
                    format!("https://dl-cdn.alpinelinux.org/{tail}"),
                    format!("https://mirror.leaseweb.com/{tail}"),
                    format!("https://uk.alpinelinux.org/{tail}"),
                ]
            }
            Self::Ubuntu => {
                let arch = ubuntu_arch();
                let tail = format!(
                    "ubuntu-base/releases/{UBUNTU_SERIES}/release/ubuntu-base-{UBUNTU_RELEASE}-base-{arch}.tar.gz"
                );
                vec![
                    format!("https://cdimage.ubuntu.com/{tail}"),
                    format!("https://mirrors.tuna.tsinghua.edu.cn/ubuntu-cdimage/{tail}"),
                ]
            }
        }
    }

    /// Shell command that updates the package index and installs the Python
    /// interpreter plus a minimal build toolchain.
    #[must_use]
    pub fn bootstrap_command(&self) -> &'static str {
        match self {
            Self::Alpine => "apk update && apk add python3 py3-pip gcc musl-dev",
            Self::Ubuntu => {
                "apt-get update && apt-get install -y --no-install-recommends \
                 python3 python3-pip build-essential"
            }
        }
    }

    /// Shell command that upgrades the language package manager itself.
    /// Best-effort: a non-zero exit here never fails the pipeline.
    #[must_use]
    pub fn upgrade_command(&self) -> &'static str {
        "python3 -m pip install --upgrade pip --break-system-packages"
    }
}

impl std::fmt::Display for Distribution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Distribution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "alpine" => Ok(Self::Alpine),
            "ubuntu" => Ok(Self::Ubuntu),
            other => Err(format!(
                "unknown distribution {other:?} (expected \"alpine\" or \"ubuntu\")"
            )),
        }
    }
}

/// Alpine's architecture token for the current host.
fn alpine_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "x86_64",
        "aarch64" => "aarch64",
        "arm" => "armv7",
        "x86" => "x86",
        other => other_arch_fallback(other),
    }
}

/// Ubuntu's architecture token for the current host (Debian-style naming).
fn ubuntu_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armhf",
        other => other_arch_fallback(other),
    }
}

fn other_arch_fallback(arch: &str) -> &'static str {
    tracing::warn!(arch, "no known rootfs architecture token, assuming x86_64");
    "x86_64"
}

/// Lifecycle status of an environment.
///
/// Monotonic forward progression; `Error` and `Cancelled` are terminal and
/// require full re-provisioning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvStatus {
    /// Created but no pipeline work started.
    #[default]
    Uninitialized,
    /// Rootfs archive download in progress.
    Downloading,
    /// Archive unpacking in progress.
    Extracting,
    /// Writing in-rootfs configuration (resolver).
    Configuring,
    /// Running the in-sandbox runtime bootstrap.
    InstallingRuntime,
    /// Fully provisioned and usable.
    Ready,
    /// Terminal failure; see the error message.
    Error,
    /// Terminal cooperative cancellation.
    Cancelled,
}

impl EnvStatus {
    /// Returns true for states a pipeline run can never leave.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ready | Self::Error | Self::Cancelled)
    }
}

impl std::fmt::Display for EnvStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Configuring => "configuring",
            Self::InstallingRuntime => "installing-runtime",
            Self::Ready => "ready",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One provisioned (or in-flight) sandbox environment.
#[derive(Debug, Clone)]
pub struct Environment {
    /// Opaque caller-assigned identifier.
    pub id: String,
    /// Distribution the rootfs came from.
    pub distribution: Distribution,
    /// Absolute path of the extracted filesystem tree.
    pub root_path: PathBuf,
    /// Current lifecycle status.
    pub status: EnvStatus,
    /// Set only on the transition into `Ready`.
    pub installed_at: Option<DateTime<Utc>>,
    /// Set only in `Error`.
    pub error_message: Option<String>,
}

/// Configuration for provisioning and execution.
///
/// # Example
///
/// ```
/// use prootbox::provision::ProvisionConfig;
/// use std::time::Duration;
///
/// let config = ProvisionConfig::default()
///     .with_base_dir("/data/envs")
///     .with_tool_path("/data/bin/proot")
///     .with_bootstrap_timeout(Duration::from_secs(900));
/// ```
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Provisioning root; one subdirectory per environment. Must sit on an
    /// execute-capable filesystem region.
    pub base_dir: PathBuf,

    /// Path to the proot binary.
    pub tool_path: PathBuf,

    /// Host directory bind-mounted into every sandbox so files written by
    /// the surrounding application are visible inside. Optional.
    pub shared_storage_dir: Option<PathBuf>,

    /// Replaces the distribution's default rootfs source list when set
    /// (enterprise mirrors, tests).
    pub sources_override: Option<Vec<String>>,

    /// Timeout for the in-sandbox runtime bootstrap commands. Package
    /// installation is slow; this defaults well above the interactive
    /// execution default.
    pub bootstrap_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            tool_path: default_tool_path(),
            shared_storage_dir: None,
            sources_override: None,
            bootstrap_timeout: Duration::from_secs(600),
        }
    }
}

impl ProvisionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the provisioning root directory.
    #[must_use]
    pub fn with_base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = path.into();
        self
    }

    /// Sets the sandbox tool binary path.
    #[must_use]
    pub fn with_tool_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tool_path = path.into();
        self
    }

    /// Sets the host directory exposed inside every sandbox.
    #[must_use]
    pub fn with_shared_storage(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_storage_dir = Some(path.into());
        self
    }

    /// Replaces the default rootfs source list.
    #[must_use]
    pub fn with_sources_override(mut self, sources: Vec<String>) -> Self {
        self.sources_override = Some(sources);
        self
    }

    /// Sets the runtime-bootstrap timeout.
    #[must_use]
    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }
}

/// Default provisioning root: the platform's local data directory.
fn default_base_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("prootbox")
        .join("envs")
}

/// Default tool path: `proot` from `$PATH`, else the conventional location.
fn default_tool_path() -> PathBuf {
    which::which("proot").unwrap_or_else(|_| PathBuf::from("/usr/bin/proot"))
}

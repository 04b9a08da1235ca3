//! Privilege-free Linux sandbox environments via proot.
//!
//! prootbox provisions self-contained Linux root filesystems (Alpine or
//! Ubuntu) into a plain directory and runs shell commands inside them through
//! proot's userland syscall translation. No root, no namespaces, no kernel
//! features beyond `ptrace`: it works in containers, CI runners, and other
//! locked-down hosts.
//!
//! The typical flow:
//!
//! ```no_run
//! use prootbox::{Distribution, ExecRequest, ProvisionConfig, SandboxService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = SandboxService::new(ProvisionConfig::default());
//!
//! let handle = service.install_environment(Distribution::Alpine, "scratch");
//! let env = handle.wait()?;
//!
//! let result = service.execute(&env.id, &ExecRequest::new("python3 --version"));
//! println!("{}", result.stdout);
//! # Ok(())
//! # }
//! ```
//!
//! Installation runs on a background thread; subscribe with
//! [`SandboxService::subscribe_progress`] and
//! [`SandboxService::subscribe_output`] to watch it, and cancel cooperatively
//! through the handle's token or [`SandboxService::cancel_setup`].

pub mod error;
pub mod events;
pub mod provision;
pub mod sandbox;
pub mod service;
pub mod system;

pub use error::{Error, Result};
pub use events::{ProgressEvent, RunToken, OUT_OF_BAND};
pub use provision::{Distribution, EnvStatus, Environment, ProvisionConfig};
pub use sandbox::{ExecRequest, ExecutionResult, SandboxExecutor, DEFAULT_EXEC_TIMEOUT};
pub use service::{InstallHandle, SandboxService};

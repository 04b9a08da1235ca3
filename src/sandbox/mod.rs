//! Sandboxed command execution.
//!
//! [`SandboxExecutor`] runs shell commands inside a provisioned rootfs via
//! proot; [`ExecRequest`] describes one command to run.

mod config;
mod executor;

pub use config::{ExecRequest, DEFAULT_EXEC_TIMEOUT};
pub use executor::{ExecutionResult, SandboxExecutor};

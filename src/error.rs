//! Error types for prootbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Pipeline-level failures carry a machine-readable kind plus a human-readable,
//! actionable message. Execution-level failures never surface here: they are
//! reported inline in [`crate::sandbox::ExecutionResult`] with the `-1` exit
//! code sentinel, so callers can always render something even on failure.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the crate.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Environment provisioning failed
    #[error("environment provisioning failed")]
    #[diagnostic(code(prootbox::provision))]
    Provision(#[from] ProvisionError),

    /// Environment registry error
    #[error("environment registry error")]
    #[diagnostic(code(prootbox::registry))]
    Registry(#[from] RegistryError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(prootbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised by the provisioning pipeline.
#[derive(Error, Debug, Diagnostic)]
pub enum ProvisionError {
    /// The sandbox tool binary is absent or not executable. Fatal, no retry:
    /// nothing downstream can work without it.
    #[error("sandbox tool not found at {path}")]
    #[diagnostic(
        code(prootbox::provision::tool_missing),
        help("install a proot binary at the expected location, or point --proot at one")
    )]
    ToolMissing { path: PathBuf },

    /// The provisioning root sits on a filesystem mounted noexec, so extracted
    /// binaries could never run.
    #[error("provisioning root {path} is on a noexec mount")]
    #[diagnostic(
        code(prootbox::provision::noexec_root),
        help("choose a base directory on an execute-capable filesystem region")
    )]
    RootNotExecCapable { path: PathBuf },

    /// Every candidate rootfs source failed.
    #[error("root filesystem download failed")]
    #[diagnostic(code(prootbox::provision::download))]
    DownloadFailed(#[from] FetchError),

    /// The rootfs archive could not be unpacked.
    #[error("root filesystem extraction failed")]
    #[diagnostic(code(prootbox::provision::extract))]
    ExtractionFailed(#[from] ExtractError),

    /// The run was cancelled cooperatively. Terminal, distinct from Error.
    #[error("provisioning cancelled")]
    #[diagnostic(code(prootbox::provision::cancelled))]
    Cancelled,

    /// A provisioning run is already active for this environment id.
    #[error("environment {id} is already being provisioned")]
    #[diagnostic(
        code(prootbox::provision::in_flight),
        help("wait for the active run to finish, or cancel it first")
    )]
    AlreadyRunning { id: String },

    /// The background worker exited without reporting an outcome.
    #[error("provisioning worker terminated unexpectedly: {message}")]
    #[diagnostic(code(prootbox::provision::internal))]
    Internal { message: String },

    /// Filesystem operation failed during provisioning.
    #[error("provisioning I/O failure: {context}")]
    #[diagnostic(code(prootbox::provision::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the source-fallback downloader.
///
/// Individual candidate failures are not errors; they advance the fallback.
#[derive(Error, Debug, Diagnostic)]
pub enum FetchError {
    /// All candidate URLs were tried and none produced the file.
    #[error("all {tried} download sources failed (last error: {last})")]
    #[diagnostic(
        code(prootbox::fetch::exhausted),
        help("check network connectivity, or supply a custom source list")
    )]
    Exhausted { tried: usize, last: String },

    /// The download was cancelled between or during attempts.
    #[error("download cancelled")]
    #[diagnostic(code(prootbox::fetch::cancelled))]
    Cancelled,
}

/// Errors raised by the archive extractor.
///
/// Only stream-level problems are fatal; unsupported or out-of-tree entries
/// are skipped, not errors.
#[derive(Error, Debug, Diagnostic)]
pub enum ExtractError {
    /// Corrupt gzip framing or a truncated tar header.
    #[error("archive stream error: {context}")]
    #[diagnostic(code(prootbox::extract::stream))]
    Stream {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The destination tree could not be created or written.
    #[error("extraction destination error: {context}")]
    #[diagnostic(code(prootbox::extract::destination))]
    Destination {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by the environment registry.
#[derive(Error, Debug, Diagnostic)]
pub enum RegistryError {
    /// Environment id would escape the provisioning root.
    #[error("invalid environment id: {id:?}")]
    #[diagnostic(
        code(prootbox::registry::invalid_id),
        help("environment ids must be non-empty and must not contain path separators")
    )]
    InvalidId { id: String },

    /// Filesystem operation failed.
    #[error("registry I/O failure: {context}")]
    #[diagnostic(code(prootbox::registry::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

//! Execution request configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default timeout for interactive command execution.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// One shell command to run inside an environment.
///
/// # Example
///
/// ```
/// use prootbox::sandbox::ExecRequest;
/// use std::time::Duration;
///
/// let req = ExecRequest::new("apk add curl")
///     .with_working_dir("/root")
///     .with_timeout(Duration::from_secs(300));
/// ```
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Opaque shell command string, passed to the resolved shell via `-c`.
    pub command: String,

    /// Working directory inside the sandbox.
    pub working_dir: PathBuf,

    /// Hard wall-clock timeout.
    pub timeout: Duration,
}

impl ExecRequest {
    /// Creates a request with the default working directory (`/`) and timeout.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: PathBuf::from("/"),
            timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }

    /// Sets the working directory inside the sandbox.
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = path.into();
        self
    }

    /// Sets the wall-clock timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

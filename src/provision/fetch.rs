//! Source-fallback download of rootfs archives.
//!
//! Candidates are tried strictly in order; any failure (connect timeout,
//! non-2xx status, read error, write error) deletes the partial file and
//! advances to the next candidate. Only exhausting the whole list is an
//! error, and it never leaves a partial file behind.
//!
//! Bytes stream straight to disk through a fixed-size buffer. When the
//! response declares a length, fractional progress is mapped into a
//! caller-supplied `[start, end]` sub-range so several pipeline stages can
//! share one progress bar.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::FetchError;
use crate::events::{ProgressReporter, RunToken};

/// Bounded connect timeout; dead mirrors must not hang the pipeline.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Bounded per-read timeout.
pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Copy buffer size for streaming to disk.
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Builds the HTTP agent used for rootfs downloads: bounded timeouts,
/// redirects followed transparently.
#[must_use]
pub fn rootfs_agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(CONNECT_TIMEOUT)
        .timeout_read(READ_TIMEOUT)
        .redirects(8)
        .build()
}

/// Outcome of one candidate attempt.
enum Attempt {
    Done,
    Failed(String),
    Cancelled,
}

/// Downloads the first working candidate from `sources` into `dest`.
///
/// Progress fractions are emitted within `[range.0, range.1]` after each
/// buffer flush when the response declares a total length; each new attempt
/// announces itself as `source N/M`.
///
/// # Errors
///
/// Returns [`FetchError::Exhausted`] when every candidate fails, and
/// [`FetchError::Cancelled`] when `token` is set; in both cases no partial
/// destination file remains.
#[instrument(skip(agent, sources, progress, token), fields(candidates = sources.len(), dest = %dest.display()))]
pub fn fetch_first_available(
    agent: &ureq::Agent,
    sources: &[String],
    dest: &Path,
    progress: &ProgressReporter,
    range: (f32, f32),
    token: &RunToken,
) -> Result<(), FetchError> {
    let total_sources = sources.len();
    let mut last_error = String::from("no sources configured");

    for (index, url) in sources.iter().enumerate() {
        if token.is_cancelled() {
            remove_partial(dest);
            return Err(FetchError::Cancelled);
        }

        progress.emit(
            format!(
                "Downloading root filesystem (source {}/{})",
                index + 1,
                total_sources
            ),
            range.0,
        );

        match fetch_one(agent, url, dest, progress, range, token) {
            Attempt::Done => {
                debug!(url, "download complete");
                return Ok(());
            }
            Attempt::Failed(reason) => {
                warn!(url, reason, "download source failed, trying next");
                remove_partial(dest);
                last_error = reason;
            }
            Attempt::Cancelled => {
                remove_partial(dest);
                return Err(FetchError::Cancelled);
            }
        }
    }

    Err(FetchError::Exhausted {
        tried: total_sources,
        last: last_error,
    })
}

/// Streams one candidate to disk. Never leaves `dest` behind on failure;
/// the caller removes it.
fn fetch_one(
    agent: &ureq::Agent,
    url: &str,
    dest: &Path,
    progress: &ProgressReporter,
    range: (f32, f32),
    token: &RunToken,
) -> Attempt {
    let response = match agent.get(url).call() {
        Ok(r) => r,
        Err(e) => return Attempt::Failed(e.to_string()),
    };

    let total_len: Option<u64> = response
        .header("content-length")
        .and_then(|v| v.parse().ok())
        .filter(|n| *n > 0);

    let mut reader = response.into_reader();
    let mut file = match fs::File::create(dest) {
        Ok(f) => f,
        Err(e) => return Attempt::Failed(format!("cannot create {}: {e}", dest.display())),
    };

    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut written: u64 = 0;
    loop {
        if token.is_cancelled() {
            return Attempt::Cancelled;
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => return Attempt::Failed(format!("read error: {e}")),
        };
        if let Err(e) = file.write_all(&buf[..n]) {
            return Attempt::Failed(format!("write error: {e}"));
        }
        written += n as u64;

        if let Some(total) = total_len {
            let done = (written as f32 / total as f32).clamp(0.0, 1.0);
            let fraction = range.0 + (range.1 - range.0) * done;
            progress.emit(
                format!("Downloading root filesystem ({:.0}%)", done * 100.0),
                fraction,
            );
        }
    }

    if let Err(e) = file.flush() {
        return Attempt::Failed(format!("flush error: {e}"));
    }
    Attempt::Done
}

/// Removes a partial destination file, if any.
fn remove_partial(dest: &Path) {
    if dest.exists() {
        let _ = fs::remove_file(dest);
    }
}

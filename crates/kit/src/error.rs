//! Typed error kinds for the cloning core.
//!
//! The orchestration layer reports failures through `color_eyre`, but the
//! leaf modules (command execution, LVM parsing, XML editing, domain lookup)
//! return these typed kinds so callers and tests can distinguish a failed
//! sanity check from a failed tool invocation.

use thiserror::Error;

/// Convenience alias used throughout the leaf modules.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds produced by the cloning core.
///
/// Nothing here is retried: every error surfaces immediately and terminates
/// the process with a nonzero exit status.
#[derive(Debug, Error)]
pub enum Error {
    /// A sanity check failed before any external mutation was performed.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A spawned tool exited with a nonzero status.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailed {
        /// The program that was spawned.
        program: String,
        /// Exit status, or "signal" if terminated by one.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// Malformed tool output or XML that could not be understood.
    #[error("parse error: {0}")]
    Parse(String),

    /// A requested domain or volume does not exist.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// A required element is missing from a domain document.
    #[error("malformed domain XML: missing <{0}> element")]
    MalformedConfig(&'static str),

    /// An edit target was not present in the document.
    #[error("not found: {0}")]
    NotFound(String),

    /// A value outside the accepted domain of a field.
    #[error("{field} out of range: {value}")]
    Range {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value.
        value: u64,
    },

    /// An underlying I/O failure (spawning a process, reading a file).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

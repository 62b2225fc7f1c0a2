//! Error taxonomy shared by the catalog, the derivative pipeline and the
//! streaming layer. The HTTP layer turns these into `ApiError`s; nothing in
//! here is ever rendered verbatim to a client.

use std::{io, process::ExitStatus};

use thiserror::Error;

/// Failures surfaced by the media components.
#[derive(Debug, Error)]
pub enum MediaError {
    /// Missing category, video or thumbnail.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed or out-of-bounds `Range` header for a file of `size` bytes.
    #[error("range not satisfiable for {size} bytes")]
    InvalidRange { size: u64 },

    /// The remux tool exited with an error.
    #[error("building {target} failed: {reason}")]
    BuildFailed { target: String, reason: String },

    /// The remux tool did not finish within the configured timeout.
    #[error("building {target} timed out")]
    BuildTimedOut { target: String },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] axum::http::Error),
}

pub type MediaResult<T> = Result<T, MediaError>;

/// Failures reported by an external media tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {stderr}")]
    Exited {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    /// The tool reported success but left no usable output behind.
    #[error("no output written to {path}")]
    EmptyOutput { path: String },

    #[error("{0}")]
    Other(String),
}

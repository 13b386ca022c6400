use std::{error::Error as StdError, path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Boxed error returned by a caller-supplied blame handler.
pub type HandlerError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors that may occur while running `git blame` or parsing its porcelain output.
#[derive(Debug, Error)]
pub enum BlameError {
    /// The blamed path does not exist at the requested revision.
    ///
    /// `message` is git's stderr, trimmed, and is also the `Display` output.
    #[error("{message}")]
    PathNotFound { message: String },
    #[error("git binary `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "tried to run git blame {revision} on {path} ({directory}) {attempts} times and every spawn failed: {source}"
    )]
    RetryExhausted {
        attempts: u32,
        revision: String,
        path: PathBuf,
        directory: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid author-time `{value}` on porcelain line {line_number}")]
    MalformedTimestamp { line_number: usize, value: String },
    #[error("blame handler failed on porcelain line {line_number}: {source}")]
    Handler {
        line_number: usize,
        #[source]
        source: HandlerError,
    },
    #[error("failed writing raw blame output to sink: {0}")]
    SinkWrite(#[source] std::io::Error),
    #[error("failed reading blame output: {0}")]
    StreamRead(#[source] std::io::Error),
    #[error("git blame exited with {status}: {stderr}")]
    NonZeroExit { status: ExitStatus, stderr: String },
    #[error("revision must not be empty")]
    EmptyRevision,
    #[error("path must not be empty")]
    EmptyPath,
    #[error("git stdout unavailable")]
    StdoutUnavailable,
    #[error("git stderr unavailable")]
    StderrUnavailable,
    #[error("failed to wait for git process: {source}")]
    Wait {
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading git stderr: {0}")]
    StderrRead(#[source] std::io::Error),
    #[error("failed to join git stderr task: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("failed to open cached blame output `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BlameError {
    /// Returns `true` when git reported that the path does not exist at the revision.
    pub fn is_path_not_found(&self) -> bool {
        matches!(self, BlameError::PathNotFound { .. })
    }

    /// Returns the handler's own error when the parse was aborted by the handler.
    pub fn handler_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            BlameError::Handler { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

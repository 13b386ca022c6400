#![forbid(unsafe_code)]
//! Async helper around `git blame --line-porcelain` that yields per-line authorship.
//!
//! The crate has two halves:
//! - a streaming parser for the line-porcelain format ([`parse_porcelain`]) that accumulates
//!   `author`/`author-mail`/`author-time` metadata and emits one [`BlameLine`] per content
//!   line, optionally teeing the raw stream to a sink;
//! - a process runner ([`BlameClient`]) that spawns git, retries transient spawn failures,
//!   feeds stdout into the parser and reconciles git's exit status with the parse result.
//!
//! The parser does not depend on the runner. Output captured through a sink can be replayed
//! with [`parse_porcelain`] or, without a runtime, with [`BlamePorcelainReader`].
//!
//! ```rust,no_run
//! use git_blame::{generate, BlameLine};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut lines: Vec<BlameLine> = Vec::new();
//! generate(".", "HEAD", "README.md", |line| {
//!     lines.push(line);
//!     Ok::<_, git_blame::HandlerError>(())
//! }, None)
//! .await?;
//! # Ok(()) }
//! ```

mod client;
mod defaults;
mod error;
mod porcelain;
mod process;
mod stream;

use std::path::PathBuf;

pub use client::{BlameClient, BlameClientBuilder, BlameRequest};
pub use error::{BlameError, HandlerError};
pub use porcelain::{
    blame_porcelain_file, BlameLine, BlamePorcelainFileReader, BlamePorcelainParser,
    BlamePorcelainReader,
};
pub use stream::{parse_porcelain, parse_porcelain_with_cancellation, DynRawSink};
pub use tokio_util::sync::CancellationToken;

/// Blames `path` at `revision` in `directory` using a default [`BlameClient`].
pub async fn generate<F, E>(
    directory: impl Into<PathBuf>,
    revision: impl Into<String>,
    path: impl Into<PathBuf>,
    handler: F,
    sink: Option<DynRawSink<'_>>,
) -> Result<(), BlameError>
where
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    let request = BlameRequest::new(directory, revision, path);
    BlameClient::default()
        .generate(&request, handler, sink)
        .await
}

/// Cancellable variant of [`generate`].
pub async fn generate_with_cancellation<F, E>(
    cancel: &CancellationToken,
    directory: impl Into<PathBuf>,
    revision: impl Into<String>,
    path: impl Into<PathBuf>,
    handler: F,
    sink: Option<DynRawSink<'_>>,
) -> Result<(), BlameError>
where
    F: FnMut(BlameLine) -> Result<(), E>,
    E: Into<HandlerError>,
{
    let request = BlameRequest::new(directory, revision, path);
    BlameClient::default()
        .generate_with_cancellation(cancel, &request, handler, sink)
        .await
}

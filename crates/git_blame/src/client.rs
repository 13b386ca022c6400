use std::{collections::BTreeMap, ffi::OsString, path::PathBuf, process::Stdio};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    defaults::{default_binary_path, DEFAULT_CHILD_ENV},
    process::{abandon, capture_stderr, exit_error, spawn_with_retry},
    stream::{drive_porcelain, DynRawSink},
    BlameError, BlameLine, HandlerError,
};

/// What to blame: a file path at a revision, resolved inside a working directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlameRequest {
    /// Working directory git runs in; usually the repository root.
    pub directory: PathBuf,
    /// Any revision git understands (commit sha, branch, tag, `HEAD~2`, ...).
    pub revision: String,
    /// File path relative to `directory`.
    pub path: PathBuf,
}

impl BlameRequest {
    pub fn new(
        directory: impl Into<PathBuf>,
        revision: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            directory: directory.into(),
            revision: revision.into(),
            path: path.into(),
        }
    }

    /// Arguments passed to git, excluding the binary itself.
    pub fn argv(&self) -> Vec<OsString> {
        vec![
            OsString::from("blame"),
            OsString::from(&self.revision),
            OsString::from("-e"),
            OsString::from("--root"),
            OsString::from("--line-porcelain"),
            OsString::from("--"),
            self.path.as_os_str().to_os_string(),
        ]
    }

    fn validate(&self) -> Result<(), BlameError> {
        if self.revision.trim().is_empty() {
            return Err(BlameError::EmptyRevision);
        }
        if self.path.as_os_str().is_empty() {
            return Err(BlameError::EmptyPath);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default)]
pub struct BlameClientBuilder {
    binary: Option<PathBuf>,
    env: BTreeMap<String, String>,
    mirror_stderr: bool,
}

impl BlameClientBuilder {
    /// Sets the git binary. Defaults to `GIT_BINARY` when set, otherwise `git` on `PATH`.
    pub fn binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = Some(binary.into());
        self
    }

    /// Adds an environment variable for every git invocation.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Echoes git's stderr to the console while still capturing it for error reporting.
    pub fn mirror_stderr(mut self, enabled: bool) -> Self {
        self.mirror_stderr = enabled;
        self
    }

    pub fn build(mut self) -> BlameClient {
        for (key, value) in DEFAULT_CHILD_ENV {
            self.env
                .entry((*key).to_string())
                .or_insert_with(|| (*value).to_string());
        }

        BlameClient {
            binary: self.binary,
            env: self.env,
            mirror_stderr: self.mirror_stderr,
        }
    }
}

/// Runs `git blame --line-porcelain` and streams the result through the porcelain parser.
#[derive(Clone, Debug)]
pub struct BlameClient {
    binary: Option<PathBuf>,
    env: BTreeMap<String, String>,
    mirror_stderr: bool,
}

impl Default for BlameClient {
    fn default() -> Self {
        BlameClientBuilder::default().build()
    }
}

impl BlameClient {
    pub fn builder() -> BlameClientBuilder {
        BlameClientBuilder::default()
    }

    /// Blames `request.path` at `request.revision`, calling `handler` once per line of the file.
    ///
    /// `sink`, when provided, receives the raw porcelain output so it can be replayed later
    /// with [`crate::parse_porcelain`]. Git's "no such path" failure is reported as
    /// [`BlameError::PathNotFound`].
    pub async fn generate<F, E>(
        &self,
        request: &BlameRequest,
        handler: F,
        sink: Option<DynRawSink<'_>>,
    ) -> Result<(), BlameError>
    where
        F: FnMut(BlameLine) -> Result<(), E>,
        E: Into<HandlerError>,
    {
        self.generate_with_cancellation(&CancellationToken::new(), request, handler, sink)
            .await
    }

    /// Cancellable variant of [`Self::generate`].
    ///
    /// Cancellation is observed between output lines and during spawn backoff. A cancelled
    /// run kills and reaps git and returns `Ok(())`.
    pub async fn generate_with_cancellation<F, E>(
        &self,
        cancel: &CancellationToken,
        request: &BlameRequest,
        mut handler: F,
        sink: Option<DynRawSink<'_>>,
    ) -> Result<(), BlameError>
    where
        F: FnMut(BlameLine) -> Result<(), E>,
        E: Into<HandlerError>,
    {
        request.validate()?;

        let binary = self.resolve_binary();
        let mut command = Command::new(&binary);
        command
            .args(request.argv())
            .current_dir(&request.directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            command.env(key, value);
        }

        debug!(
            binary = ?binary,
            directory = ?request.directory,
            revision = %request.revision,
            path = ?request.path,
            "spawning git blame"
        );
        let Some(mut child) = spawn_with_retry(&mut command, &binary, request, cancel).await? else {
            debug!("git blame cancelled before spawn");
            return Ok(());
        };

        let stdout = child.stdout.take().ok_or(BlameError::StdoutUnavailable)?;
        let stderr = child.stderr.take().ok_or(BlameError::StderrUnavailable)?;
        let stderr_task = tokio::spawn(capture_stderr(stderr, self.mirror_stderr));

        // `stdout` is dropped (closing the pipe) when the parse returns.
        let summary = match drive_porcelain(cancel, stdout, &mut handler, sink).await {
            Ok(summary) => summary,
            Err(err) => {
                abandon(&mut child, stderr_task).await;
                return Err(err);
            }
        };

        if summary.cancelled {
            abandon(&mut child, stderr_task).await;
            debug!(records = summary.records, "git blame cancelled");
            return Ok(());
        }

        let status = child
            .wait()
            .await
            .map_err(|source| BlameError::Wait { source })?;
        let stderr = stderr_task.await?.map_err(BlameError::StderrRead)?;
        if !status.success() {
            return Err(exit_error(status, &stderr));
        }

        debug!(
            lines = summary.lines,
            records = summary.records,
            "git blame finished"
        );
        Ok(())
    }

    fn resolve_binary(&self) -> PathBuf {
        self.binary.clone().unwrap_or_else(default_binary_path)
    }
}

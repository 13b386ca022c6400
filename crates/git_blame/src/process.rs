use std::{io, path::Path, process::ExitStatus};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{Child, Command},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{
    defaults::{MAX_SPAWN_ATTEMPTS, SPAWN_BACKOFF_STEP},
    BlameError, BlameRequest,
};

const NO_SUCH_PATH: &str = "no such path";

// errno values shared by Linux and macOS.
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
const ETXTBSY: i32 = 26;

/// Spawn failures caused by process-table or descriptor pressure rather than by the
/// command itself.
fn is_transient_spawn_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::OutOfMemory
    ) || matches!(err.raw_os_error(), Some(ENFILE | EMFILE | ETXTBSY))
}

/// Spawns `command`, retrying transient failures with a linear backoff.
///
/// Returns `Ok(None)` when `cancel` fires before an attempt or during a backoff sleep.
pub(crate) async fn spawn_with_retry(
    command: &mut Command,
    binary: &Path,
    request: &BlameRequest,
    cancel: &CancellationToken,
) -> Result<Option<Child>, BlameError> {
    retry_spawn(|| command.spawn(), binary, request, cancel).await
}

async fn retry_spawn<T, S>(
    mut spawn: S,
    binary: &Path,
    request: &BlameRequest,
    cancel: &CancellationToken,
) -> Result<Option<T>, BlameError>
where
    S: FnMut() -> io::Result<T>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        match spawn() {
            Ok(child) => return Ok(Some(child)),
            Err(source) if is_transient_spawn_error(&source) => {
                if attempt >= MAX_SPAWN_ATTEMPTS {
                    return Err(BlameError::RetryExhausted {
                        attempts: attempt,
                        revision: request.revision.clone(),
                        path: request.path.clone(),
                        directory: request.directory.clone(),
                        source,
                    });
                }
                let backoff = SPAWN_BACKOFF_STEP * attempt;
                warn!(
                    binary = ?binary,
                    attempt,
                    backoff = ?backoff,
                    error = %source,
                    "git spawn failed; retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = time::sleep(backoff) => {}
                }
                attempt += 1;
            }
            Err(source) => {
                return Err(BlameError::Spawn {
                    binary: binary.to_path_buf(),
                    source,
                });
            }
        }
    }
}

/// Drains the child's stderr, optionally echoing it to our own stderr.
pub(crate) async fn capture_stderr<R>(mut reader: R, mirror_console: bool) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut console = mirror_console.then(tokio::io::stderr);
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if let Some(out) = console.as_mut() {
            out.write_all(&chunk[..n]).await?;
            out.flush().await?;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    Ok(buffer)
}

/// Kills and reaps a child whose output is no longer wanted. Its exit status is ignored.
pub(crate) async fn reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Kills git and throws away its stderr without waiting for the pipe to close.
///
/// A grandchild that inherited the pipe can keep it open long after git is gone.
pub(crate) async fn abandon(child: &mut Child, stderr_task: JoinHandle<io::Result<Vec<u8>>>) {
    reap(child).await;
    stderr_task.abort();
    let _ = stderr_task.await;
}

/// Maps a failed git exit to the caller-facing error.
pub(crate) fn exit_error(status: ExitStatus, stderr: &[u8]) -> BlameError {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    if stderr.contains(NO_SUCH_PATH) {
        BlameError::PathNotFound { message: stderr }
    } else {
        BlameError::NonZeroExit { status, stderr }
    }
}

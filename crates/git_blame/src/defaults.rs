use std::{env, path::PathBuf, time::Duration};

pub(crate) const GIT_BINARY_ENV: &str = "GIT_BINARY";

/// Attempts allowed for spawning `git` before giving up.
pub(crate) const MAX_SPAWN_ATTEMPTS: u32 = 3;
/// Backoff unit; the sleep after attempt `n` is `n * SPAWN_BACKOFF_STEP`.
pub(crate) const SPAWN_BACKOFF_STEP: Duration = Duration::from_millis(100);

pub(crate) const DEFAULT_CHILD_ENV: &[(&str, &str)] = &[
    ("GIT_PAGER", "cat"),
    ("GIT_TERMINAL_PROMPT", "0"),
    // Keeps stderr in English so `no such path` can be detected.
    ("LC_ALL", "C"),
];

pub(crate) fn default_binary_path() -> PathBuf {
    env::var_os(GIT_BINARY_ENV)
        .filter(|value| !value.to_string_lossy().trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("git"))
}

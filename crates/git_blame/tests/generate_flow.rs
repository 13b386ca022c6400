#[cfg(unix)]
mod unix {
    use std::{
        fs,
        path::{Path, PathBuf},
        time::{Duration, Instant},
    };

    use git_blame::{
        BlameClient, BlameError, BlameLine, BlameRequest, CancellationToken, HandlerError,
    };
    use tempfile::TempDir;

    const REVISION: &str = "f4946ed58916394539223458f9085a96508494e0";

    fn fixture_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join(name)
    }

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("fake-git");
        fs::write(&script_path, format!("#!/bin/sh\nset -eu\n{body}")).expect("write script");
        let mut perms = fs::metadata(&script_path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).expect("chmod");
        script_path
    }

    /// A fake git that checks its argv and prints `blame.porcelain` from its working directory.
    fn porcelain_script(dir: &Path) -> PathBuf {
        fs::copy(
            fixture_path("readme.porcelain"),
            dir.join("blame.porcelain"),
        )
        .expect("copy fixture");

        write_script(
            dir,
            &format!(
                r#"expected="blame {REVISION} -e --root --line-porcelain -- README.md"
if [ "$*" != "$expected" ]; then
  echo "unexpected args: $*" >&2
  exit 10
fi
cat blame.porcelain
"#
            ),
        )
    }

    fn client(script: &Path) -> BlameClient {
        BlameClient::builder().binary(script).build()
    }

    fn readme_request(dir: &Path) -> BlameRequest {
        BlameRequest::new(dir, REVISION, "README.md")
    }

    #[tokio::test]
    async fn generate_streams_records_and_tees_raw_output() {
        let dir = TempDir::new().expect("temp dir");
        let script = porcelain_script(dir.path());

        let mut lines: Vec<BlameLine> = Vec::new();
        let mut cache: Vec<u8> = Vec::new();
        client(&script)
            .generate(
                &readme_request(dir.path()),
                |line| {
                    lines.push(line);
                    Ok::<_, HandlerError>(())
                },
                Some(&mut cache),
            )
            .await
            .expect("generate");

        assert_eq!(lines.len(), 56);
        assert_eq!(lines[22].author_email, "sam@example.com");
        assert_eq!(cache, fs::read(fixture_path("readme.porcelain")).expect("fixture"));

        let rendered: String = lines.iter().map(|l| format!("{}\n", l.content)).collect();
        assert_eq!(
            rendered,
            fs::read_to_string(fixture_path("readme.out")).expect("fixture")
        );
    }

    #[tokio::test]
    async fn missing_path_is_distinguished_and_not_retried() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            r#"echo run >> invocations.log
echo "fatal: no such path $7 in $2" >&2
exit 128
"#,
        );

        let request = BlameRequest::new(dir.path(), REVISION, "missing.fsh");
        let err = client(&script)
            .generate(&request, |_| Ok::<_, HandlerError>(()), None)
            .await
            .expect_err("missing path");

        assert!(err.is_path_not_found(), "unexpected error: {err:?}");
        assert_eq!(
            err.to_string(),
            format!("fatal: no such path missing.fsh in {REVISION}")
        );
        let log = fs::read_to_string(dir.path().join("invocations.log")).expect("log");
        assert_eq!(log.lines().count(), 1);
    }

    #[tokio::test]
    async fn other_failures_report_status_and_trimmed_stderr() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            r#"printf '  fatal: bad revision\n\n' >&2
exit 3
"#,
        );

        let err = client(&script)
            .generate(&readme_request(dir.path()), |_| Ok::<_, HandlerError>(()), None)
            .await
            .expect_err("non-zero exit");

        match err {
            BlameError::NonZeroExit { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "fatal: bad revision");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_error_wins_over_exit_status() {
        let dir = TempDir::new().expect("temp dir");
        let script = porcelain_script(dir.path());

        let mut calls = 0;
        let err = client(&script)
            .generate(
                &readme_request(dir.path()),
                |_| {
                    calls += 1;
                    if calls == 5 {
                        Err("stop at five")
                    } else {
                        Ok(())
                    }
                },
                None,
            )
            .await
            .expect_err("handler failure");

        assert_eq!(calls, 5);
        match err {
            BlameError::Handler { source, .. } => assert_eq!(source.to_string(), "stop at five"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_kills_git_and_succeeds() {
        let dir = TempDir::new().expect("temp dir");
        fs::copy(
            fixture_path("readme.porcelain"),
            dir.path().join("blame.porcelain"),
        )
        .expect("copy fixture");
        let script = write_script(
            dir.path(),
            r#"cat blame.porcelain
exec sleep 30
"#,
        );

        let cancel = CancellationToken::new();
        let mut calls = 0;
        let client = client(&script);
        let request = readme_request(dir.path());
        let started = Instant::now();
        let run = client.generate_with_cancellation(
            &cancel,
            &request,
            |_| {
                calls += 1;
                if calls == 3 {
                    cancel.cancel();
                }
                Ok::<_, HandlerError>(())
            },
            None,
        );
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("cancelled run returns promptly")
            .expect("cancellation is success");

        assert_eq!(calls, 3);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    /// A wrapper that leaves a background child holding stdout and stderr open.
    fn lingering_child_script(dir: &Path) -> PathBuf {
        fs::copy(
            fixture_path("readme.porcelain"),
            dir.join("blame.porcelain"),
        )
        .expect("copy fixture");
        write_script(
            dir,
            r#"sleep 30 &
cat blame.porcelain
wait
"#,
        )
    }

    #[tokio::test]
    async fn cancellation_does_not_wait_for_lingering_children() {
        let dir = TempDir::new().expect("temp dir");
        let script = lingering_child_script(dir.path());

        let cancel = CancellationToken::new();
        let mut calls = 0;
        let client = client(&script);
        let request = readme_request(dir.path());
        let started = Instant::now();
        let run = client.generate_with_cancellation(
            &cancel,
            &request,
            |_| {
                calls += 1;
                if calls == 3 {
                    cancel.cancel();
                }
                Ok::<_, HandlerError>(())
            },
            None,
        );
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("cancelled run returns promptly")
            .expect("cancellation is success");

        assert_eq!(calls, 3);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn handler_error_does_not_wait_for_lingering_children() {
        let dir = TempDir::new().expect("temp dir");
        let script = lingering_child_script(dir.path());

        let client = client(&script);
        let request = readme_request(dir.path());
        let started = Instant::now();
        let run = client.generate(&request, |_| Err("first record rejected"), None);
        let err = tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("failed run returns promptly")
            .expect_err("handler failure");

        assert!(matches!(err, BlameError::Handler { .. }), "unexpected error: {err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs_git() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            r#"echo run >> invocations.log
printf 'author Late\n\tline\n'
"#,
        );

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0;
        client(&script)
            .generate_with_cancellation(
                &cancel,
                &readme_request(dir.path()),
                |_| {
                    calls += 1;
                    Ok::<_, HandlerError>(())
                },
                None,
            )
            .await
            .expect("cancellation is success");

        assert_eq!(calls, 0);
        assert!(!dir.path().join("invocations.log").exists());
    }

    #[tokio::test]
    async fn missing_binary_fails_without_retry_delay() {
        let dir = TempDir::new().expect("temp dir");
        let started = Instant::now();
        let err = client(&dir.path().join("no-such-git"))
            .generate(&readme_request(dir.path()), |_| Ok::<_, HandlerError>(()), None)
            .await
            .expect_err("spawn failure");

        assert!(matches!(err, BlameError::Spawn { .. }), "unexpected error: {err:?}");
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn empty_request_fields_are_rejected() {
        let client = BlameClient::default();
        let dir = TempDir::new().expect("temp dir");

        let err = client
            .generate(
                &BlameRequest::new(dir.path(), "  ", "README.md"),
                |_| Ok::<_, HandlerError>(()),
                None,
            )
            .await
            .expect_err("empty revision");
        assert!(matches!(err, BlameError::EmptyRevision));

        let err = client
            .generate(
                &BlameRequest::new(dir.path(), "HEAD", ""),
                |_| Ok::<_, HandlerError>(()),
                None,
            )
            .await
            .expect_err("empty path");
        assert!(matches!(err, BlameError::EmptyPath));
    }

    #[tokio::test]
    async fn builder_env_reaches_git() {
        let dir = TempDir::new().expect("temp dir");
        let script = write_script(
            dir.path(),
            r#"if [ "${BLAME_MARKER:-}" != "on" ] || [ "${LC_ALL:-}" != "C" ]; then
  echo "missing env" >&2
  exit 4
fi
printf 'author Env\n\tok\n'
"#,
        );

        let mut lines = Vec::new();
        BlameClient::builder()
            .binary(&script)
            .env("BLAME_MARKER", "on")
            .build()
            .generate(
                &readme_request(dir.path()),
                |line| {
                    lines.push(line);
                    Ok::<_, HandlerError>(())
                },
                None,
            )
            .await
            .expect("generate");

        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].author_name, "Env");
    }

    #[tokio::test]
    async fn repeated_runs_do_not_leak_processes_or_descriptors() {
        let dir = TempDir::new().expect("temp dir");
        let script = porcelain_script(dir.path());
        let client = client(&script);
        let request = readme_request(dir.path());

        // Enough iterations to exhaust the fd or process table if anything leaked.
        for _ in 0..1000 {
            let mut count = 0;
            client
                .generate(
                    &request,
                    |_| {
                        count += 1;
                        Ok::<_, HandlerError>(())
                    },
                    None,
                )
                .await
                .expect("generate");
            assert_eq!(count, 56);
        }
    }
}

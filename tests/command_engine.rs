//! Integration tests for the command engine against the real platform shell.
//!
//! These exercise the full spawn/drain/timeout path with `/bin/sh`, so they
//! are unix-only. They run as part of the standard `cargo test` invocation;
//! no external tools beyond a POSIX shell are required.

#![cfg(unix)]

use std::time::{Duration, Instant};

use clusterbox::command::{
    CommandDriver, CommandHandlers, CommandRequest, CommandRunner, OutputEncoding,
    ScriptHandlers, ScriptRunner,
};
use clusterbox::Error;

fn sh(line: &str) -> CommandRequest {
    CommandRequest::new("sh", &["-c", line])
}

// ---------------------------------------------------------------------------
// Timeout contract
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_fires_even_when_child_never_exits() {
    let runner = CommandRunner::new();
    let started = Instant::now();
    let result = runner
        .run_capture(sh("sleep 60").timeout_secs(1).kill_on_timeout())
        .await;

    assert!(
        matches!(result, Err(Error::Timeout { timeout_secs: 1, .. })),
        "expected a timeout, got {result:?}"
    );
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "run must return promptly after the deadline, took {:?}",
        started.elapsed()
    );
}

/// A shell that backgrounds a long sleep leaves a grandchild the direct
/// child's death would orphan. The timeout kill must take the whole
/// process group, not just the shell.
#[tokio::test]
async fn timeout_kill_takes_the_whole_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");
    let script = format!("sleep 60 & echo $! > {}; wait", pid_file.display());

    let runner = CommandRunner::new();
    let result = runner
        .run_capture(sh(&script).timeout_secs(1).kill_on_timeout())
        .await;
    assert!(matches!(result, Err(Error::Timeout { .. })), "got {result:?}");

    // Give the kernel a moment to reap, then check the grandchild is gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let grandchild = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
    let alive_check = runner
        .run_capture(sh(&format!("kill -0 {grandchild}")))
        .await
        .unwrap();
    assert_ne!(alive_check.exit_code, 0, "grandchild {grandchild} survived the kill");
}

#[tokio::test]
async fn fast_command_is_unaffected_by_the_timeout() {
    let runner = CommandRunner::new();
    let capture = runner
        .run_capture(sh("printf hello").timeout_secs(30))
        .await
        .expect("trivial command should succeed");
    assert_eq!(capture.exit_code, 0);
    assert_eq!(capture.stdout, "hello");
}

// ---------------------------------------------------------------------------
// Drain correctness
// ---------------------------------------------------------------------------

/// A child writing far more than a pipe buffer to both streams at once
/// deadlocks any implementation that drains sequentially. 256 KiB per
/// stream is comfortably past the usual 64 KiB pipe capacity.
#[tokio::test]
async fn large_output_on_both_streams_does_not_deadlock() {
    let line = "x".repeat(1024);
    let script = format!(
        "i=0; while [ $i -lt 256 ]; do echo {line}; echo {line} 1>&2; i=$((i+1)); done"
    );
    let runner = CommandRunner::new();
    let capture = runner
        .run_capture(sh(&script).timeout_secs(30))
        .await
        .expect("both streams must drain concurrently");

    assert_eq!(capture.exit_code, 0);
    assert_eq!(capture.stdout.lines().count(), 256);
    assert_eq!(capture.stderr.lines().count(), 256);
}

#[tokio::test]
async fn exit_code_is_reported_after_streams_close() {
    let runner = CommandRunner::new();
    let capture = runner
        .run_capture(sh("printf out; exit 3").timeout_secs(10))
        .await
        .expect("capture itself must not fail on non-zero exit");
    assert_eq!(capture.exit_code, 3);
    assert_eq!(capture.stdout, "out");
}

// ---------------------------------------------------------------------------
// Result policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn default_policy_rejects_stderr_output() {
    let runner = CommandRunner::new();
    let result = runner
        .run(sh("echo warning 1>&2"), CommandHandlers::default())
        .await;
    assert!(
        matches!(result, Err(Error::CommandReportedError { .. })),
        "non-empty stderr with no handler must fail, got {result:?}"
    );
}

#[tokio::test]
async fn error_handler_overrides_the_stderr_policy() {
    let runner = CommandRunner::new();
    let mut seen = String::new();
    let exit_code = runner
        .run(
            sh("echo expected-noise 1>&2"),
            CommandHandlers::default().error(|stderr| {
                seen.push_str(stderr);
                Ok(())
            }),
        )
        .await
        .expect("handled stderr is not a failure");
    assert_eq!(exit_code, 0);
    assert!(seen.contains("expected-noise"));
}

#[tokio::test]
async fn handler_failure_is_distinguished_from_command_failure() {
    let runner = CommandRunner::new();
    let result = runner
        .run(
            sh("printf fine"),
            CommandHandlers::default()
                .output(|_| anyhow::bail!("caller rejected the output")),
        )
        .await;
    match result {
        Err(Error::HandlerFailed { command, .. }) => assert_eq!(command, "sh"),
        other => panic!("expected HandlerFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn exit_code_handler_sees_the_real_code() {
    let runner = CommandRunner::new();
    let mut observed = None;
    runner
        .run(
            sh("exit 7"),
            CommandHandlers::default().exit_code(|code| {
                observed = Some(code);
                Ok(())
            }),
        )
        .await
        .expect("handled exit code is not a failure");
    assert_eq!(observed, Some(7));
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

#[tokio::test]
async fn utf16le_output_is_decoded() {
    // printf the UTF-16LE bytes for "ok": 6f 00 6b 00
    let runner = CommandRunner::new();
    let capture = runner
        .run_capture(
            sh(r"printf '\157\000\153\000'").encoding(OutputEncoding::Utf16Le),
        )
        .await
        .expect("command should succeed");
    assert_eq!(capture.stdout, "ok");
}

// ---------------------------------------------------------------------------
// Script runner
// ---------------------------------------------------------------------------

fn write_script(dir: &std::path::Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn script_run_leaves_a_log_file_behind() {
    let scripts = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "greet.sh", "#!/bin/sh\necho hello-from-script\n");

    let runner = ScriptRunner::new(scripts.path(), logs.path());
    let mut output = String::new();
    let exit_code = runner
        .run_script(
            "greet.sh",
            &[],
            30,
            false,
            ScriptHandlers {
                on_output: Some(Box::new(|text| {
                    output.push_str(text);
                    Ok(())
                })),
                on_exit_code: None,
            },
        )
        .await
        .expect("script should run");

    assert_eq!(exit_code, 0);
    assert!(output.contains("hello-from-script"));

    let logged: Vec<_> = std::fs::read_dir(logs.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(logged.len(), 1, "exactly one log per invocation: {logged:?}");
    assert!(logged[0].starts_with("greet.sh."));
    assert!(logged[0].ends_with(".output.txt"));
}

#[tokio::test]
async fn missing_script_is_not_found_before_anything_runs() {
    let scripts = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    let runner = ScriptRunner::new(scripts.path(), logs.path());

    let result = runner
        .run_script("absent.sh", &[], 5, false, ScriptHandlers::default())
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
    assert_eq!(
        std::fs::read_dir(logs.path()).unwrap().count(),
        0,
        "no log file for a script that never ran"
    );
}

#[tokio::test]
async fn failing_script_surfaces_its_exit_code() {
    let scripts = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_script(scripts.path(), "boom.sh", "#!/bin/sh\necho diagnostics\nexit 9\n");

    let runner = ScriptRunner::new(scripts.path(), logs.path());
    let result = runner
        .run_script("boom.sh", &[], 30, false, ScriptHandlers::default())
        .await;
    match result {
        Err(Error::CommandReportedError { exit_code, .. }) => assert_eq!(exit_code, 9),
        other => panic!("expected CommandReportedError, got {other:?}"),
    }
}

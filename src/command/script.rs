//! Script execution with a per-invocation combined-output log file.
//!
//! Scripts live under a scripts root and run through the platform shell.
//! Their stdout and stderr are merged into one timestamped log file
//! (`<scriptName>.<timestamp>.output.txt`) which is then read back and
//! handed to the caller's output handler — the log stays on disk for
//! postmortem diagnosis, the runner never deletes it.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::info;

use crate::command::runner::{
    is_elevated, CommandDriver, CommandRequest, CommandRunner,
};
use crate::error::{Error, Result};

/// Result interpretation hook for a script run, mirroring the engine's
/// handler contract: supplying a handler opts out of the default policy.
pub struct ScriptHandlers<'a> {
    pub on_output: Option<Box<dyn FnMut(&str) -> anyhow::Result<()> + Send + 'a>>,
    pub on_exit_code: Option<Box<dyn FnMut(i32) -> anyhow::Result<()> + Send + 'a>>,
}

impl Default for ScriptHandlers<'_> {
    fn default() -> Self {
        Self { on_output: None, on_exit_code: None }
    }
}

/// Runs scripts from a fixed root, logging combined output per invocation.
pub struct ScriptRunner {
    scripts_root: PathBuf,
    logs_dir: PathBuf,
    runner: CommandRunner,
}

impl ScriptRunner {
    pub fn new(scripts_root: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_root: scripts_root.into(),
            logs_dir: logs_dir.into(),
            runner: CommandRunner::new(),
        }
    }

    /// Resolve `name` under the scripts root, failing with `NotFound` if the
    /// file is absent.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let path = self.scripts_root.join(name);
        if !path.is_file() {
            return Err(Error::NotFound(format!(
                "script `{name}` not found under {}",
                self.scripts_root.display()
            )));
        }
        Ok(path)
    }

    /// Run a script through the shell, wait for it under `timeout_secs`, and
    /// hand the combined output (read back from the log file) to the output
    /// handler. Exit-code policy matches [`CommandRunner::run`].
    pub async fn run_script(
        &self,
        name: &str,
        args: &[&str],
        timeout_secs: u64,
        elevated: bool,
        mut handlers: ScriptHandlers<'_>,
    ) -> Result<i32> {
        let script = self.resolve(name)?;
        if elevated && !is_elevated() {
            return Err(Error::PermissionDenied(format!(
                "script `{name}` requires administrative rights"
            )));
        }

        let log_path = self.log_path(name);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::io(parent, e))?;
        }

        // The shell does the redirection so ordering between the two streams
        // is the guest tool's own interleaving, not ours.
        let shell_line = format!(
            "{} {} > {} 2>&1",
            shell_quote(&script),
            args.iter().map(|a| shell_quote_str(a)).collect::<Vec<_>>().join(" "),
            shell_quote(&log_path),
        );

        let request = CommandRequest::new("sh", &["-c", &shell_line]).timeout_secs(timeout_secs);
        let capture = self.runner.run_capture(request).await?;

        let output = tokio::fs::read_to_string(&log_path)
            .await
            .map_err(|e| Error::io(&log_path, e))?;

        info!(script = name, log = %log_path.display(), exit_code = capture.exit_code,
              "script completed");

        if let Some(on_output) = handlers.on_output.as_mut() {
            on_output(&output).map_err(|source| Error::HandlerFailed {
                command: name.to_string(),
                source,
            })?;
        }

        match handlers.on_exit_code.as_mut() {
            Some(on_exit) => {
                on_exit(capture.exit_code).map_err(|source| Error::HandlerFailed {
                    command: name.to_string(),
                    source,
                })?;
            }
            None if capture.exit_code != 0 => {
                return Err(Error::CommandReportedError {
                    command: name.to_string(),
                    exit_code: capture.exit_code,
                    stderr: tail(&output, 512),
                });
            }
            None => {}
        }

        Ok(capture.exit_code)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        // Colons are unsafe in file names on some filesystems, so the
        // timestamp uses dashes within the time part.
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        self.logs_dir.join(format!("{name}.{stamp}.output.txt"))
    }
}

fn shell_quote(path: &Path) -> String {
    shell_quote_str(&path.to_string_lossy())
}

fn shell_quote_str(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.trim().to_string()
    } else {
        let cut = s.len() - max;
        // Back up to a char boundary.
        let cut = (cut..s.len()).find(|i| s.is_char_boundary(*i)).unwrap_or(s.len());
        s[cut..].trim().to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_missing_script_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptRunner::new(dir.path(), dir.path().join("logs"));
        let err = runner.resolve("no-such-script.sh").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn log_path_embeds_script_name_and_suffix() {
        let runner = ScriptRunner::new("/tmp/scripts", "/tmp/logs");
        let path = runner.log_path("init-node.sh");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("init-node.sh."));
        assert!(name.ends_with(".output.txt"));
        assert!(!name.contains(':'), "log file name must not contain colons: {name}");
    }

    #[test]
    fn shell_quoting_survives_single_quotes() {
        assert_eq!(shell_quote_str("a'b"), r"'a'\''b'");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "é".repeat(600);
        let t = tail(&s, 512);
        assert!(t.chars().all(|c| c == 'é'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn script_output_is_logged_and_handed_back() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&scripts).unwrap();

        let script = scripts.join("greet.sh");
        std::fs::write(&script, "#!/bin/sh\necho hello-from-guest\necho warn-line 1>&2\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ScriptRunner::new(&scripts, &logs);
        let mut seen = String::new();
        let code = runner
            .run_script(
                "greet.sh",
                &[],
                30,
                false,
                ScriptHandlers {
                    on_output: Some(Box::new(|out| {
                        seen.push_str(out);
                        Ok(())
                    })),
                    on_exit_code: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert!(seen.contains("hello-from-guest"));
        assert!(seen.contains("warn-line"), "stderr must be merged into the log");

        let log_files: Vec<_> = std::fs::read_dir(&logs).unwrap().collect();
        assert_eq!(log_files.len(), 1, "one log file per invocation");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_script_maps_to_command_reported_error() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        std::fs::create_dir_all(&scripts).unwrap();
        let script = scripts.join("fail.sh");
        std::fs::write(&script, "#!/bin/sh\necho about-to-fail\nexit 3\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = ScriptRunner::new(&scripts, dir.path().join("logs"));
        let err = runner
            .run_script("fail.sh", &[], 30, false, ScriptHandlers::default())
            .await
            .unwrap_err();

        match err {
            Error::CommandReportedError { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("expected CommandReportedError, got {other:?}"),
        }
    }
}

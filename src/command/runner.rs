//! Process execution with concurrent stream draining and a timeout race.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// How to decode the raw bytes a tool writes to its streams.
///
/// Some platform CLIs emit UTF-16LE regardless of locale; the engine decodes
/// rather than pushing that problem onto every regex in the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEncoding {
    #[default]
    Utf8,
    Utf16Le,
}

impl OutputEncoding {
    fn decode(self, bytes: &[u8]) -> String {
        match self {
            OutputEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            OutputEncoding::Utf16Le => {
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                String::from_utf16_lossy(&units)
            }
        }
    }
}

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub encoding: OutputEncoding,
    /// Checked for existence before spawning so the caller gets a clear
    /// `NotFound` instead of an opaque spawn error.
    pub working_dir: Option<PathBuf>,
    /// Fail with `PermissionDenied` before spawning if the current process
    /// is not elevated.
    pub must_run_as_admin: bool,
    /// Kill the child's whole process group if the deadline wins the race
    /// (the child is placed in its own group at spawn so descendants die
    /// with it). Off by default: a forced kill of an unrecognized external
    /// tool is riskier than a leaked process, so leaking is the documented
    /// default.
    pub kill_on_timeout: bool,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs: 60,
            encoding: OutputEncoding::Utf8,
            working_dir: None,
            must_run_as_admin: false,
            kill_on_timeout: false,
        }
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn encoding(mut self, encoding: OutputEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn as_admin(mut self) -> Self {
        self.must_run_as_admin = true;
        self
    }

    pub fn kill_on_timeout(mut self) -> Self {
        self.kill_on_timeout = true;
        self
    }
}

/// Fully drained result of a command, before any policy is applied.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Caller-supplied interpretation of a command's result.
///
/// Supplying any handler opts the caller out of the default policy for the
/// part it covers; the handler's own errors are wrapped as
/// [`Error::HandlerFailed`] so they are never confused with the command
/// itself failing.
#[derive(Default)]
pub struct CommandHandlers<'a> {
    pub on_output: Option<Box<dyn FnMut(&str) -> anyhow::Result<()> + Send + 'a>>,
    pub on_error: Option<Box<dyn FnMut(&str) -> anyhow::Result<()> + Send + 'a>>,
    pub on_exit_code: Option<Box<dyn FnMut(i32) -> anyhow::Result<()> + Send + 'a>>,
}

impl<'a> CommandHandlers<'a> {
    pub fn output(mut self, f: impl FnMut(&str) -> anyhow::Result<()> + Send + 'a) -> Self {
        self.on_output = Some(Box::new(f));
        self
    }

    pub fn error(mut self, f: impl FnMut(&str) -> anyhow::Result<()> + Send + 'a) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn exit_code(mut self, f: impl FnMut(i32) -> anyhow::Result<()> + Send + 'a) -> Self {
        self.on_exit_code = Some(Box::new(f));
        self
    }
}

// ---------------------------------------------------------------------------
// Elevation probe
// ---------------------------------------------------------------------------

/// Whether the current process runs with administrative rights.
#[cfg(unix)]
pub fn is_elevated() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
    false
}

// ---------------------------------------------------------------------------
// The runner
// ---------------------------------------------------------------------------

/// Spawns external processes and drains their output safely under a timeout.
///
/// Stateless and cheap to clone; every call is independent.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner;

/// The seam the VM providers talk through. Kept narrow (capture only, no
/// handlers) so provider state machines can be tested against canned tool
/// output without spawning anything.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandDriver: Send + Sync {
    async fn run_capture(&self, request: CommandRequest) -> Result<CommandCapture>;

    /// Launch a long-lived process without waiting for it, returning its
    /// pid. The child outlives this handle deliberately — stopping it later
    /// is the caller's job, via OS inspection.
    async fn spawn_detached(&self, request: CommandRequest) -> Result<u32>;
}

#[async_trait]
impl CommandDriver for CommandRunner {
    async fn run_capture(&self, request: CommandRequest) -> Result<CommandCapture> {
        self.capture(request).await
    }

    async fn spawn_detached(&self, request: CommandRequest) -> Result<u32> {
        if let Some(dir) = &request.working_dir {
            if !dir.is_dir() {
                return Err(Error::NotFound(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }
        if request.must_run_as_admin && !is_elevated() {
            return Err(Error::PermissionDenied(format!(
                "`{}` requires administrative rights",
                request.command
            )));
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false);
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("binary `{}` not found", request.command))
            } else {
                Error::ExecutionFailed {
                    command: request.command.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id().ok_or_else(|| Error::ExecutionFailed {
            command: request.command.clone(),
            source: std::io::Error::other("child exited before its pid could be read"),
        })?;
        debug!(command = %request.command, pid, "detached process launched");
        Ok(pid)
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run a command under the full engine contract and return its exit code.
    ///
    /// Default policy with no handlers: non-empty stderr or a non-zero exit
    /// code fails with [`Error::CommandReportedError`]. Handlers replace the
    /// default for the part they cover.
    pub async fn run(
        &self,
        request: CommandRequest,
        mut handlers: CommandHandlers<'_>,
    ) -> Result<i32> {
        let command = request.command.clone();
        let capture = self.capture(request).await?;

        if let Some(on_output) = handlers.on_output.as_mut() {
            on_output(&capture.stdout).map_err(|source| Error::HandlerFailed {
                command: command.clone(),
                source,
            })?;
        }

        match handlers.on_error.as_mut() {
            Some(on_error) => {
                on_error(&capture.stderr).map_err(|source| Error::HandlerFailed {
                    command: command.clone(),
                    source,
                })?;
            }
            None if !capture.stderr.trim().is_empty() => {
                return Err(Error::CommandReportedError {
                    command,
                    exit_code: capture.exit_code,
                    stderr: capture.stderr.trim().to_string(),
                });
            }
            None => {}
        }

        match handlers.on_exit_code.as_mut() {
            Some(on_exit) => {
                on_exit(capture.exit_code).map_err(|source| Error::HandlerFailed {
                    command: command.clone(),
                    source,
                })?;
            }
            None if capture.exit_code != 0 => {
                return Err(Error::CommandReportedError {
                    command,
                    exit_code: capture.exit_code,
                    stderr: capture.stderr.trim().to_string(),
                });
            }
            None => {}
        }

        Ok(capture.exit_code)
    }

    /// Spawn, drain both streams concurrently and race against the deadline.
    ///
    /// Success requires the conjunction: process exited AND both streams
    /// signalled end-of-stream. Either alone can mean truncated output or a
    /// zombie pipe.
    async fn capture(&self, request: CommandRequest) -> Result<CommandCapture> {
        if let Some(dir) = &request.working_dir {
            if !dir.is_dir() {
                return Err(Error::NotFound(format!(
                    "working directory {} does not exist",
                    dir.display()
                )));
            }
        }

        if request.must_run_as_admin && !is_elevated() {
            return Err(Error::PermissionDenied(format!(
                "`{}` requires administrative rights",
                request.command
            )));
        }

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }
        // A killable child gets its own process group so the timeout can
        // take its descendants down with it.
        #[cfg(unix)]
        if request.kill_on_timeout {
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("binary `{}` not found", request.command))
            } else {
                Error::ExecutionFailed {
                    command: request.command.clone(),
                    source,
                }
            }
        })?;

        // Both pipes are drained by independent tasks so the child can never
        // block writing to one while we read the other.
        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");

        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let res = stdout_pipe.read_to_end(&mut buf).await;
            (buf, res)
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let res = stderr_pipe.read_to_end(&mut buf).await;
            (buf, res)
        });

        let deadline = Duration::from_secs(request.timeout_secs);
        let drive = async {
            let status = child.wait().await.map_err(|source| Error::ExecutionFailed {
                command: request.command.clone(),
                source,
            })?;
            let (stdout_buf, stdout_res) = stdout_task.await.map_err(|e| {
                Error::ExecutionFailed {
                    command: request.command.clone(),
                    source: std::io::Error::other(e),
                }
            })?;
            let (stderr_buf, stderr_res) = stderr_task.await.map_err(|e| {
                Error::ExecutionFailed {
                    command: request.command.clone(),
                    source: std::io::Error::other(e),
                }
            })?;
            stdout_res.map_err(|source| Error::ExecutionFailed {
                command: request.command.clone(),
                source,
            })?;
            stderr_res.map_err(|source| Error::ExecutionFailed {
                command: request.command.clone(),
                source,
            })?;
            Ok::<_, Error>((status, stdout_buf, stderr_buf))
        };

        // Bound first so the drive future (and its borrow of `child`) is
        // dropped before the timeout branch touches the child again.
        let timed = tokio::time::timeout(deadline, drive).await;
        let (status, stdout_buf, stderr_buf) = match timed {
            Ok(result) => result?,
            Err(_) => {
                if request.kill_on_timeout {
                    warn!(command = %request.command, "timeout, killing process group");
                    #[cfg(unix)]
                    if let Some(pid) = child.id() {
                        use nix::sys::signal::{killpg, Signal};
                        let _ = killpg(nix::unistd::Pid::from_raw(pid as i32), Signal::SIGKILL);
                    }
                    let _ = child.kill().await;
                } else {
                    warn!(
                        command = %request.command,
                        "timeout, leaving child running (kill_on_timeout off)"
                    );
                }
                return Err(Error::Timeout {
                    command: request.command,
                    timeout_secs: request.timeout_secs,
                });
            }
        };

        let exit_code = status.code().unwrap_or(-1);
        debug!(command = %request.command, exit_code, "command completed");

        Ok(CommandCapture {
            exit_code,
            stdout: request.encoding.decode(&stdout_buf),
            stderr: request.encoding.decode(&stderr_buf),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16le_decoding() {
        let bytes: Vec<u8> = "vm-a\n".encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
        assert_eq!(OutputEncoding::Utf16Le.decode(&bytes), "vm-a\n");
    }

    #[test]
    fn utf8_decoding_is_lossy_not_fatal() {
        let bytes = [b'o', b'k', 0xFF, b'!'];
        let decoded = OutputEncoding::Utf8.decode(&bytes);
        assert!(decoded.starts_with("ok"));
        assert!(decoded.ends_with('!'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_working_dir_is_not_found() {
        let req = CommandRequest::new("true", &[])
            .working_dir("/definitely/not/a/real/dir");
        let err = CommandRunner::new()
            .run(req, CommandHandlers::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_binary_is_not_found() {
        let req = CommandRequest::new("clusterbox-no-such-binary", &[]);
        let err = CommandRunner::new()
            .run(req, CommandHandlers::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn admin_gate_rejects_before_spawn() {
        if is_elevated() {
            return; // CI containers sometimes run as root; nothing to assert.
        }
        let req = CommandRequest::new("true", &[]).as_admin();
        let err = CommandRunner::new()
            .run(req, CommandHandlers::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PermissionDenied(_)), "got {err:?}");
    }
}

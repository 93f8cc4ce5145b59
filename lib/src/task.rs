//! Supervised execution of external package-manager commands.
//!
//! Every invocation runs noninteractively in the C locale so output parsing
//! is stable across machines. While a child runs, the caller's cancellation
//! token is observed: on cancellation the child receives SIGTERM, then
//! SIGKILL once the grace period expires.

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// How long a child may linger after SIGTERM before SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(15);

/// Captured outcome of a supervised command.
#[derive(Debug, Clone)]
pub(crate) struct CommandOutput {
    /// Exit code; `-1` when the child was terminated by a signal.
    pub(crate) exit_code: i32,
    /// Decoded stdout (lossy UTF-8).
    pub(crate) stdout: String,
    /// Decoded stderr (lossy UTF-8).
    pub(crate) stderr: String,
    /// True when the watchdog terminated the child.
    pub(crate) killed: bool,
}

impl CommandOutput {
    /// Clean zero exit without watchdog intervention.
    pub(crate) fn success(&self) -> bool {
        self.exit_code == 0 && !self.killed
    }
}

/// Builder for one supervised external command.
#[derive(Debug)]
pub(crate) struct Task {
    description: String,
    cmd: Command,
}

impl Task {
    /// Create a task; stdin is closed and the locale pinned to C.
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        let mut cmd = Command::new(exe.as_ref());
        cmd.stdin(Stdio::null());
        cmd.env("LANG", "C");
        cmd.env("LC_ALL", "C");
        cmd.kill_on_drop(true);
        Self {
            description: description.as_ref().to_string(),
            cmd,
        }
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    pub(crate) fn env(mut self, k: impl AsRef<OsStr>, v: impl AsRef<OsStr>) -> Self {
        self.cmd.env(k, v);
        self
    }

    /// Run the child to completion, capturing output. Returns an error only
    /// when the child could not be spawned or waited on; a nonzero exit is
    /// reported through [`CommandOutput`].
    pub(crate) async fn run(self, cancel: &CancellationToken) -> Result<CommandOutput> {
        let description = self.description;
        let mut cmd = self.cmd;
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        tracing::debug!("exec: {cmd:?}");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {description} failed"))?;
        let mut stdout = child.stdout.take().context("child stdout not piped")?;
        let mut stderr = child.stderr.take().context("child stderr not piped")?;
        let pid = child.id();

        // Drain both pipes concurrently with the wait so a chatty child
        // cannot deadlock on a full pipe buffer.
        let out_fut = async move {
            let mut buf = Vec::new();
            stdout.read_to_end(&mut buf).await.map(|_| buf)
        };
        let err_fut = async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await.map(|_| buf)
        };
        let wait_fut = async {
            let mut killed = false;
            let status = tokio::select! {
                st = child.wait() => st?,
                _ = cancel.cancelled() => {
                    killed = true;
                    send_sigterm(pid);
                    tokio::select! {
                        st = child.wait() => st?,
                        _ = tokio::time::sleep(KILL_GRACE) => {
                            let _ = child.start_kill();
                            child.wait().await?
                        }
                    }
                }
            };
            Ok::<_, anyhow::Error>((status, killed))
        };
        let (out, err, waited) = tokio::join!(out_fut, err_fut, wait_fut);
        let (status, killed) = waited.with_context(|| format!("Executing {description} failed"))?;
        let output = CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&err.unwrap_or_default()).into_owned(),
            killed,
        };
        if killed {
            tracing::warn!("{description}: terminated by watchdog");
        } else if output.exit_code != 0 {
            tracing::debug!("{description}: exited {}", output.exit_code);
        }
        Ok(output)
    }
}

fn send_sigterm(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
        tracing::debug!("SIGTERM to {pid} failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_output_and_exit() -> Result<()> {
        let cancel = CancellationToken::new();
        let r = Task::new("echo", "/bin/sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .run(&cancel)
            .await?;
        assert_eq!(r.exit_code, 3);
        assert_eq!(r.stdout.trim(), "out");
        assert_eq!(r.stderr.trim(), "err");
        assert!(!r.killed);
        assert!(!r.success());
        Ok(())
    }

    #[tokio::test]
    async fn test_watchdog_terminates_child() -> Result<()> {
        let cancel = CancellationToken::new();
        let child_cancel = cancel.clone();
        let start = std::time::Instant::now();
        let task = Task::new("sleep", "/bin/sleep").args(["30"]);
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            child_cancel.cancel();
            Ok::<_, anyhow::Error>(())
        };
        let (r, _) = tokio::try_join!(task.run(&cancel), canceller)?;
        assert!(r.killed);
        assert!(start.elapsed() < Duration::from_secs(10));
        Ok(())
    }

    #[tokio::test]
    async fn test_locale_pinned() -> Result<()> {
        let cancel = CancellationToken::new();
        let r = Task::new("env probe", "/bin/sh")
            .args(["-c", "echo $LC_ALL"])
            .run(&cancel)
            .await?;
        assert_eq!(r.stdout.trim(), "C");
        Ok(())
    }
}

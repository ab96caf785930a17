//! Synchronous execution of external programs.

use std::io::{Read, Seek};
use std::process::Command;

use anyhow::{Context, Result};

/// An external program that exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("`{command}` failed ({status}){}", stderr_suffix(.stderr))]
pub struct CommandError {
    pub command: String,
    /// Exit code, or `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub status: String,
    pub stderr: String,
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}

/// Render a command as a shell-like line for logs and diagnostics.
pub fn display(cmd: &Command) -> String {
    let mut line = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        line.push(' ');
        let arg = arg.to_string_lossy();
        if arg.is_empty() || arg.contains(char::is_whitespace) {
            line.push_str(&format!("{arg:?}"));
        } else {
            line.push_str(&arg);
        }
    }
    line
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRun {
    /// Execute the child process, failing with [`CommandError`] on a
    /// non-zero exit.
    fn run(&mut self) -> Result<()>;

    /// Execute the child process and capture its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Only the tail of stderr is kept to avoid pathological error messages.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    const MAX_STDERR_BYTES: u64 = 1024;
    let size = f.metadata().map(|m| m.len()).unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let mut buf = Vec::with_capacity(size as usize);
    match f
        .seek(std::io::SeekFrom::End(-(size as i64)))
        .and_then(|_| f.read_to_end(&mut buf))
    {
        Ok(_) => String::from_utf8_lossy(&buf).into_owned(),
        Err(e) => {
            tracing::warn!("failed to read captured stderr: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl CommandRun for Command {
    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile().context("failed to create stderr capture file")?;
        self.stderr(stderr.try_clone()?);
        let line = display(self);
        tracing::debug!("exec: {line}");
        let status = self
            .status()
            .with_context(|| format!("failed to execute `{line}`"))?;
        let captured = last_utf8_content_from_file(stderr);
        if !captured.trim().is_empty() {
            tracing::debug!("stderr of `{line}`: {}", captured.trim());
        }
        if status.success() {
            return Ok(());
        }
        Err(CommandError {
            command: line,
            code: status.code(),
            status: status.to_string(),
            stderr: captured,
        }
        .into())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let mut stdout = tempfile::tempfile().context("failed to create stdout capture file")?;
        self.stdout(stdout.try_clone()?);
        self.run()?;
        stdout.seek(std::io::SeekFrom::Start(0)).context("seek")?;
        let mut s = String::new();
        stdout
            .read_to_string(&mut s)
            .context("command output is not valid UTF-8")?;
        Ok(s)
    }
}

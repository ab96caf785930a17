//! Failure handling: the scoped work directory, best-effort rollback of a
//! half-created VM, and the diagnostic printed when a run fails.

use std::path::Path;

use anyhow::{Context, Result};

use crate::command::CommandError;
use crate::error;
use crate::provision::StepFailure;
use crate::pve::{Hypervisor, VmStatus};

/// Temporary directory owned by one provisioning session. Removed when
/// dropped, on every exit path.
pub struct WorkDir {
    dir: Option<tempfile::TempDir>,
}

impl WorkDir {
    pub fn create() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("pvevm-")
            .tempdir()
            .context("failed to create work directory")?;
        tracing::debug!("created work directory {}", dir.path().display());
        Ok(Self { dir: Some(dir) })
    }

    pub fn path(&self) -> &Path {
        self.dir
            .as_ref()
            .map(|d| d.path())
            .unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => tracing::debug!("removed work directory {}", path.display()),
                Err(e) => tracing::warn!("failed to remove {}: {e}", path.display()),
            }
        }
    }
}

/// Stop (if running) and destroy a partially created VM. Errors are logged
/// and swallowed: the failure that triggered the rollback is the one
/// reported.
pub fn rollback(hypervisor: &dyn Hypervisor, vmid: u32) {
    tracing::warn!("rolling back VM {vmid}");
    match hypervisor.vm_status(vmid) {
        Ok(VmStatus::Running) => {
            if let Err(e) = hypervisor.stop(vmid) {
                tracing::warn!("failed to stop VM {vmid}: {e:#}");
            }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("failed to query status of VM {vmid}: {e:#}"),
    }
    match hypervisor.destroy(vmid) {
        Ok(()) => eprintln!("removed partially created VM {vmid}"),
        Err(e) => tracing::warn!("failed to destroy VM {vmid}: {e:#}"),
    }
}

fn find_command_error(err: &anyhow::Error) -> Option<&CommandError> {
    err.downcast_ref::<CommandError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<CommandError>()))
}

/// What the operator is told about a failed run.
#[derive(Debug)]
pub struct Diagnostic {
    pub exit_code: i32,
    pub step: Option<&'static str>,
    pub line: Option<u32>,
    pub command: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn from_error(err: &anyhow::Error) -> Self {
        let failure = err.downcast_ref::<StepFailure>();
        let command = find_command_error(err);
        let exit_code = command
            .and_then(|c| c.code)
            .filter(|&code| code != 0)
            .map(|code| code.clamp(1, 255))
            .unwrap_or(1);
        Self {
            exit_code,
            step: failure.map(|f| f.step.name()),
            line: failure.map(|f| f.line),
            command: command.map(|c| c.command.clone()),
            message: format!("{err:#}"),
        }
    }

    pub fn render(&self, log_file: &Path) -> String {
        let mut out = String::from("[ERROR]");
        if let Some(line) = self.line {
            out.push_str(&format!(" in line {line}"));
        }
        out.push_str(&format!(": exit code {}", self.exit_code));
        if let Some(step) = self.step {
            out.push_str(&format!(": while executing step \"{step}\""));
        }
        if let Some(command) = &self.command {
            out.push_str(&format!("\n  command: {command}"));
        }
        out.push_str(&format!("\n  {}", self.message));
        out.push_str(&format!("\n  see {} for details", log_file.display()));
        out
    }
}

/// Report the outcome of a failed run and return the process exit code.
/// Operator cancellation is a clean exit.
pub fn report(err: &anyhow::Error, log_file: &Path) -> i32 {
    if error::is_cancelled(err) {
        tracing::info!("cancelled by operator");
        eprintln!("cancelled; nothing was changed");
        return 0;
    }
    let diagnostic = Diagnostic::from_error(err);
    tracing::error!(
        exit_code = diagnostic.exit_code,
        step = diagnostic.step.unwrap_or("-"),
        "{}",
        diagnostic.message
    );
    eprintln!("{}", diagnostic.render(log_file));
    diagnostic.exit_code
}

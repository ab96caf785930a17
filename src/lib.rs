//! Interactive provisioning of Proxmox VE virtual machines from upstream
//! appliance releases.
//!
//! The workflow runs in one direction: the release catalog is fetched,
//! the operator picks a release, storage and optional USB device, and the
//! provisioner drives `qm` to create the VM. Failures after a VM id has
//! been allocated roll the VM back.

pub mod catalog;
pub mod cleanup;
pub mod command;
pub mod config;
pub mod download;
pub mod error;
pub mod format;
pub mod menu;
pub mod provision;
pub mod pve;
pub mod select;
pub mod system_check;
pub mod usb;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

use std::ffi::CString;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

/// Set by the SIGINT/SIGTERM handler; polled by long-running loops.
pub static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::Relaxed);
}

/// Route SIGINT and SIGTERM to the [`INTERRUPTED`] flag so that an interrupt
/// unwinds through the normal error path and its cleanup.
pub fn install_interrupt_handler() {
    let handler = on_interrupt as extern "C" fn(libc::c_int) as libc::sighandler_t;
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

/// Fail with [`error::ProvisionError::Interrupted`] once a signal has
/// been received.
pub fn check_interrupted() -> Result<()> {
    if INTERRUPTED.load(Ordering::Relaxed) {
        return Err(error::ProvisionError::Interrupted.into());
    }
    Ok(())
}

pub struct SudoUser {
    pub home: PathBuf,
}

/// Returns info about the real user behind `sudo`, if applicable.
///
/// Looks up `SUDO_USER` in the environment. Returns `None` if the variable
/// is unset, empty, or set to "root" (running `sudo` as root is a no-op).
pub fn sudo_user() -> Option<SudoUser> {
    let name = std::env::var("SUDO_USER").ok()?;
    if name.is_empty() || name == "root" {
        return None;
    }
    let c_name = CString::new(name.as_bytes()).ok()?;
    let pw = unsafe { libc::getpwnam(c_name.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let home = unsafe { std::ffi::CStr::from_ptr((*pw).pw_dir) }
        .to_str()
        .ok()?;
    Some(SudoUser {
        home: PathBuf::from(home),
    })
}

pub fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

pub fn is_interactive_terminal() -> bool {
    unsafe { libc::isatty(libc::STDIN_FILENO) != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InterruptGuard, ENV_LOCK};

    #[test]
    fn test_check_interrupted() {
        let guard = InterruptGuard::new();
        assert!(check_interrupted().is_ok());

        guard.raise();
        let err = check_interrupted().unwrap_err();
        assert!(error::is_interrupted(&err));
        assert!(err.to_string().contains("interrupted"), "unexpected error: {err}");
    }

    #[test]
    fn test_interrupt_guard_clears_flag() {
        {
            let guard = InterruptGuard::new();
            guard.raise();
        }
        let _guard = InterruptGuard::new();
        assert!(check_interrupted().is_ok());
    }

    #[test]
    fn test_sudo_user_not_set() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::remove_var("SUDO_USER");
        assert!(sudo_user().is_none());
    }

    #[test]
    fn test_sudo_user_root() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("SUDO_USER", "root");
        assert!(sudo_user().is_none());
        std::env::remove_var("SUDO_USER");
    }

    #[test]
    fn test_sudo_user_unknown() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("SUDO_USER", "pvevm-no-such-user-xyz");
        assert!(sudo_user().is_none());
        std::env::remove_var("SUDO_USER");
    }
}

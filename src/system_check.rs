use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Result};

use crate::command::CommandRun;

/// Programs `create` shells out to, with a hint on where they come from.
pub const REQUIRED_PROGRAMS: &[(&str, &str)] = &[
    ("qm", "run on a Proxmox VE host"),
    ("pvesm", "run on a Proxmox VE host"),
    ("pvesh", "run on a Proxmox VE host"),
    ("whiptail", "apt install whiptail"),
    ("lsusb", "apt install usbutils"),
];

/// Parse `pveversion` output, e.g.
/// `pve-manager/8.1.4/ec5affc9e41f1d79 (running kernel: 6.5.11-7-pve)`.
fn parse_pve_version(output: &str) -> Result<(u32, u32)> {
    let version = output
        .trim()
        .strip_prefix("pve-manager/")
        .and_then(|rest| rest.split('/').next())
        .ok_or_else(|| anyhow::anyhow!("cannot parse Proxmox VE version: {output:?}"))?;
    let mut parts = version.split('.');
    let major: u32 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("cannot parse Proxmox VE version: {version:?}"))?;
    // Older releases report e.g. `7.1-10`.
    let minor: u32 = parts
        .next()
        .map(|s| s.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    Ok((major, minor))
}

/// Check that Proxmox VE is >= (major, minor).
pub fn check_pve_version(min_major: u32, min_minor: u32) -> Result<()> {
    let output = Command::new("pveversion").run_get_string()?;
    let (major, minor) = parse_pve_version(&output)?;
    if (major, minor) < (min_major, min_minor) {
        bail!("Proxmox VE {min_major}.{min_minor} or later is required (found {major}.{minor})");
    }
    tracing::debug!("Proxmox VE {major}.{minor}");
    Ok(())
}

/// The upstream images are built for x86_64 only.
pub fn check_arch() -> Result<()> {
    let arch = std::env::consts::ARCH;
    if arch != "x86_64" {
        bail!("unsupported host architecture {arch}; only x86_64 hosts are supported");
    }
    Ok(())
}

/// Find a program in PATH, returning its full path.
pub fn find_program(name: &str) -> Result<PathBuf> {
    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        let candidate = PathBuf::from(dir).join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    bail!("{name} not found in PATH")
}

/// Check that all required external programs are available.
///
/// `programs` is a slice of `(binary_name, package_hint)` pairs.
pub fn check_dependencies(programs: &[(&str, &str)]) -> Result<()> {
    for (name, hint) in programs {
        match find_program(name) {
            Ok(path) => tracing::debug!("found {name}: {}", path.display()),
            Err(_) => bail!("{name} not found; {hint}"),
        }
    }
    Ok(())
}

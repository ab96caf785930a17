//! Proxmox VE command-line interface: VM id allocation, OVF import, VM
//! configuration and storage listing.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};

use crate::command::CommandRun;

/// A storage that accepts VM disk images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTarget {
    pub id: String,
    /// Backend type as reported by `pvesm`, e.g. `dir`, `lvmthin`, `nfs`.
    pub backend: String,
    pub free_kib: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmStatus {
    Running,
    Stopped,
    /// Any other state reported by `qm status`.
    Other,
}

/// Disk format requested from `qm importovf`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportFormat {
    /// Let the storage backend pick its native format.
    Native,
    Qcow2,
}

impl ImportFormat {
    /// File-backed storages need an explicit image format; block backends
    /// choose their own.
    pub fn for_backend(backend: &str) -> Self {
        match backend {
            "dir" | "nfs" => ImportFormat::Qcow2,
            _ => ImportFormat::Native,
        }
    }
}

/// The hypervisor operations the provisioner needs.
pub trait Hypervisor {
    fn next_vmid(&self) -> Result<u32>;
    fn storage_status(&self) -> Result<Vec<StorageTarget>>;
    fn vm_status(&self, vmid: u32) -> Result<VmStatus>;
    fn stop(&self, vmid: u32) -> Result<()>;
    fn destroy(&self, vmid: u32) -> Result<()>;
    fn import_ovf(&self, vmid: u32, ovf: &Path, storage: &str, format: ImportFormat) -> Result<()>;
    fn vm_config(&self, vmid: u32) -> Result<String>;
    /// `qm set <vmid>` with the given option/value arguments.
    fn set(&self, vmid: u32, args: &[String]) -> Result<()>;
    fn resize(&self, vmid: u32, disk: &str, size: &str) -> Result<()>;
}

/// [`Hypervisor`] backed by `qm`, `pvesm` and `pvesh`.
pub struct QmCli;

impl Hypervisor for QmCli {
    fn next_vmid(&self) -> Result<u32> {
        let out = Command::new("pvesh")
            .args(["get", "/cluster/nextid"])
            .run_get_string()?;
        parse_vmid(&out)
    }

    fn storage_status(&self) -> Result<Vec<StorageTarget>> {
        let out = Command::new("pvesm")
            .args(["status", "-content", "images"])
            .run_get_string()?;
        parse_storage_status(&out)
    }

    fn vm_status(&self, vmid: u32) -> Result<VmStatus> {
        let out = Command::new("qm")
            .args(["status", &vmid.to_string()])
            .run_get_string()?;
        Ok(parse_vm_status(&out))
    }

    fn stop(&self, vmid: u32) -> Result<()> {
        Command::new("qm").args(["stop", &vmid.to_string()]).run()
    }

    fn destroy(&self, vmid: u32) -> Result<()> {
        Command::new("qm")
            .args(["destroy", &vmid.to_string()])
            .run()
    }

    fn import_ovf(&self, vmid: u32, ovf: &Path, storage: &str, format: ImportFormat) -> Result<()> {
        let mut cmd = Command::new("qm");
        cmd.arg("importovf").arg(vmid.to_string()).arg(ovf).arg(storage);
        if format == ImportFormat::Qcow2 {
            cmd.args(["--format", "qcow2"]);
        }
        cmd.run()
    }

    fn vm_config(&self, vmid: u32) -> Result<String> {
        Command::new("qm")
            .args(["config", &vmid.to_string()])
            .run_get_string()
    }

    fn set(&self, vmid: u32, args: &[String]) -> Result<()> {
        Command::new("qm")
            .args(["set", &vmid.to_string()])
            .args(args)
            .run()
    }

    fn resize(&self, vmid: u32, disk: &str, size: &str) -> Result<()> {
        Command::new("qm")
            .args(["resize", &vmid.to_string(), disk, size])
            .run()
    }
}

pub fn parse_vmid(out: &str) -> Result<u32> {
    let trimmed = out.trim().trim_matches('"');
    trimmed
        .parse::<u32>()
        .with_context(|| format!("invalid VM id from hypervisor: {trimmed:?}"))
}

/// Parse `pvesm status` output:
///
/// ```text
/// Name             Type     Status           Total            Used       Available        %
/// local             dir     active        98497780        12345678        81089756   12.53%
/// ```
pub fn parse_storage_status(out: &str) -> Result<Vec<StorageTarget>> {
    let mut targets = Vec::new();
    for line in out.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 6 {
            bail!("unexpected pvesm status line: {line:?}");
        }
        let free_kib = fields[5]
            .parse::<u64>()
            .with_context(|| format!("invalid free space in pvesm status line: {line:?}"))?;
        targets.push(StorageTarget {
            id: fields[0].to_string(),
            backend: fields[1].to_string(),
            free_kib,
        });
    }
    Ok(targets)
}

/// Parse `qm status` output (`status: running`).
pub fn parse_vm_status(out: &str) -> VmStatus {
    let state = out
        .lines()
        .find_map(|l| l.trim().strip_prefix("status:"))
        .map(str::trim)
        .unwrap_or_default();
    match state {
        "running" => VmStatus::Running,
        "stopped" => VmStatus::Stopped,
        _ => VmStatus::Other,
    }
}

/// A disk attached to a VM, as found in `qm config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSlot {
    /// Config key, e.g. `sata0`.
    pub slot: String,
    /// Volume id, e.g. `local-lvm:vm-100-disk-0`.
    pub volume: String,
}

fn is_disk_key(key: &str) -> bool {
    ["sata", "scsi"].iter().any(|bus| {
        key.strip_prefix(bus)
            .map(|idx| !idx.is_empty() && idx.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    })
}

/// Find the first SATA or SCSI disk in `qm config` output, skipping cdrom
/// drives and empty slots.
pub fn find_imported_disk(config: &str) -> Option<DiskSlot> {
    config.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.trim();
        if !is_disk_key(key) {
            return None;
        }
        let value = value.trim();
        if value.contains("media=cdrom") {
            return None;
        }
        let volume = value.split(',').next().unwrap_or_default();
        if volume.is_empty() || volume == "none" {
            return None;
        }
        Some(DiskSlot {
            slot: key.to_string(),
            volume: volume.to_string(),
        })
    })
}

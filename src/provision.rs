//! VM creation: the fixed sequence of hypervisor steps that turns a chosen
//! release into a configured VM.

use std::fmt;

use anyhow::{Context, Result};

use crate::catalog::{ReleaseEntry, ReleaseSource};
use crate::cleanup::WorkDir;
use crate::config::Config;
use crate::check_interrupted;
use crate::download;
use crate::error::{self, ProvisionError};
use crate::pve::{find_imported_disk, DiskSlot, Hypervisor, ImportFormat, StorageTarget};
use crate::usb::UsbCandidate;

/// Everything the operator chose, plus the VM id once allocated.
pub struct Session {
    /// Set as soon as the hypervisor hands out an id; from then on a failure
    /// must roll the VM back.
    pub vmid: Option<u32>,
    pub release: ReleaseEntry,
    pub storage: StorageTarget,
    pub usb: Option<UsbCandidate>,
    pub work_dir: WorkDir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    AllocateId,
    Download,
    Extract,
    Import,
    DiscoverDisk,
    Configure,
    BootOrder,
    Resize,
    AttachUsb,
}

impl Step {
    pub fn name(self) -> &'static str {
        match self {
            Step::AllocateId => "allocate VM id",
            Step::Download => "download image",
            Step::Extract => "extract image",
            Step::Import => "import image",
            Step::DiscoverDisk => "discover imported disk",
            Step::Configure => "configure VM",
            Step::BootOrder => "set boot order",
            Step::Resize => "resize disk",
            Step::AttachUsb => "attach USB device",
        }
    }
}

/// Context attached to the error of a failed step.
#[derive(Debug, Clone, Copy)]
pub struct StepFailure {
    pub step: Step,
    pub line: u32,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step \"{}\" failed (line {})", self.step.name(), self.line)
    }
}

/// Run one step. A pending interrupt fails the step before it starts, and
/// a signal that arrives while it runs fails it once it returns.
#[track_caller]
fn step<T>(step: Step, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let line = std::panic::Location::caller().line();
    let result = check_interrupted().and_then(|()| {
        tracing::info!("step: {}", step.name());
        let value = f()?;
        check_interrupted()?;
        Ok(value)
    });
    result.map_err(|e| e.context(StepFailure { step, line }))
}

/// Disk the imported image ends up on.
pub const SYSTEM_DISK: &str = "scsi0";

/// `qm set` arguments applied right after import.
pub fn vm_settings(config: &Config, disk: &DiskSlot) -> Vec<String> {
    let cores = config.cores.to_string();
    let net0 = format!("virtio,bridge={},firewall=1", config.bridge);
    let scsi0 = format!("{},discard=on,iothread=1", disk.volume);
    let mut pairs: Vec<(&str, &str)> = vec![
        ("acpi", "1"),
        ("cores", cores.as_str()),
        ("numa", "1"),
        ("agent", "1,fstrim_cloned_disks=1"),
        ("hotplug", "network,disk,usb,cpu,memory"),
        ("description", config.description.as_str()),
        ("net0", net0.as_str()),
        ("onboot", "1"),
        ("tablet", "0"),
        ("ostype", "l26"),
        ("scsihw", "virtio-scsi-single"),
    ];
    if disk.slot != SYSTEM_DISK {
        pairs.push(("delete", disk.slot.as_str()));
    }
    pairs.push((SYSTEM_DISK, scsi0.as_str()));
    set_args(&pairs)
}

fn set_args(pairs: &[(&str, &str)]) -> Vec<String> {
    pairs
        .iter()
        .flat_map(|(opt, val)| [format!("--{opt}"), val.to_string()])
        .collect()
}

/// Create the VM described by `session`. The allocated id is recorded in
/// `session.vmid` before anything else touches the hypervisor.
pub fn run(
    hypervisor: &dyn Hypervisor,
    source: &dyn ReleaseSource,
    session: &mut Session,
    config: &Config,
) -> Result<u32> {
    let vmid = step(Step::AllocateId, || hypervisor.next_vmid())?;
    session.vmid = Some(vmid);
    eprintln!("✓ Using VM id {vmid}");

    let release = &session.release;
    let work_dir = session.work_dir.path();
    let archive = step(Step::Download, || {
        download::fetch_image(
            source,
            &release.download_url,
            release.digest.as_deref(),
            work_dir,
        )
    })?;
    eprintln!("✓ Downloaded {} {}", release.kind, release.version);

    let ovf = step(Step::Extract, || {
        download::extract_image(&archive, &work_dir.join("image"))
    })?;
    eprintln!("✓ Extracted {}", ovf.display());

    let storage = &session.storage;
    let format = ImportFormat::for_backend(&storage.backend);
    step(Step::Import, || {
        hypervisor
            .import_ovf(vmid, &ovf, &storage.id, format)
            .map_err(|e| error::unless_interrupted(e, ProvisionError::ImportFailed(vmid)))
    })?;
    eprintln!("✓ Imported image into storage {}", storage.id);

    let disk = step(Step::DiscoverDisk, || {
        let vm_config = hypervisor.vm_config(vmid)?;
        find_imported_disk(&vm_config)
            .with_context(|| format!("no SATA or SCSI disk in configuration of VM {vmid}"))
    })?;
    tracing::debug!("imported disk {} on {}", disk.volume, disk.slot);

    step(Step::Configure, || {
        hypervisor.set(vmid, &vm_settings(config, &disk))
    })?;
    step(Step::BootOrder, || {
        let order = format!("order={SYSTEM_DISK}");
        hypervisor.set(vmid, &set_args(&[("boot", order.as_str())]))
    })?;
    step(Step::Resize, || {
        hypervisor.resize(vmid, SYSTEM_DISK, &config.disk_size)
    })?;
    eprintln!("✓ Configured VM {vmid} ({} system disk)", config.disk_size);

    if let Some(dev) = &session.usb {
        step(Step::AttachUsb, || {
            let host = format!("host={},usb3=1", dev.id);
            hypervisor.set(vmid, &set_args(&[("usb0", host.as_str())]))
        })?;
        eprintln!("✓ Passed through USB device {} ({})", dev.id, dev.description);
    }

    Ok(vmid)
}

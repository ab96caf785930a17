//! Test doubles for the hypervisor, menus, release API and USB listing.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;

use crate::catalog::ReleaseSource;
use crate::command::CommandError;
use crate::config::Config;
use crate::menu::{Menu, MenuItem, Selection};
use crate::pve::{Hypervisor, ImportFormat, StorageTarget, VmStatus};
use crate::usb::UsbSource;

/// Serializes tests that read or write process environment variables.
pub static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that depend on the global INTERRUPTED flag.
static INTERRUPT_LOCK: Mutex<()> = Mutex::new(());

/// Holds INTERRUPT_LOCK with the flag cleared, and clears it again on drop.
pub struct InterruptGuard {
    _lock: MutexGuard<'static, ()>,
}

impl InterruptGuard {
    pub fn new() -> Self {
        let lock = INTERRUPT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::INTERRUPTED.store(false, Ordering::Relaxed);
        Self { _lock: lock }
    }

    /// Act as if SIGINT had arrived.
    pub fn raise(&self) {
        crate::INTERRUPTED.store(true, Ordering::Relaxed);
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        crate::INTERRUPTED.store(false, Ordering::Relaxed);
    }
}

pub fn config() -> Config {
    Config {
        repo: Some("acme/appliance-os".to_string()),
        ..Config::default()
    }
}

/// Directory under the system temp dir, removed on drop.
pub struct TempDir {
    dir: PathBuf,
}

impl TempDir {
    pub fn new(suffix: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "pvevm-test-{}-{:?}-{suffix}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        Self { dir }
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.dir);
    }
}

/// An OVA-style tar archive: descriptor, disk and manifest.
pub fn build_ova(name: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let files: [(String, &[u8]); 3] = [
        (format!("{name}.ovf"), b"<Envelope/>"),
        (format!("{name}-disk1.vmdk"), b"vmdk-bytes"),
        (format!("{name}.mf"), b"SHA256(x)= 00"),
    ];
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub struct FakeReleases {
    pub releases_body: String,
    pub snapshot_body: String,
    pub image: Vec<u8>,
    pub fail_download: bool,
    pub downloads: RefCell<Vec<PathBuf>>,
}

impl FakeReleases {
    pub fn catalog(stable: &[&str], snapshot: Option<&str>) -> Self {
        let release = |tag: &str, prerelease: bool, version: Option<&str>| {
            let assets: Vec<serde_json::Value> = version
                .map(|v| {
                    vec![serde_json::json!({
                        "name": format!("appliance-{v}.ova"),
                        "browser_download_url": format!("https://dl.example/{tag}/appliance-{v}.ova"),
                    })]
                })
                .unwrap_or_default();
            serde_json::json!({"tag_name": tag, "prerelease": prerelease, "assets": assets})
        };
        let list: Vec<serde_json::Value> =
            stable.iter().map(|v| release(*v, false, Some(*v))).collect();
        Self {
            releases_body: serde_json::Value::Array(list).to_string(),
            snapshot_body: release("snapshots", true, snapshot).to_string(),
            image: build_ova("appliance"),
            fail_download: false,
            downloads: RefCell::new(Vec::new()),
        }
    }
}

impl ReleaseSource for FakeReleases {
    fn get_json(&self, url: &str) -> Result<String> {
        if url.ends_with("/tags/snapshots") {
            Ok(self.snapshot_body.clone())
        } else {
            Ok(self.releases_body.clone())
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        self.downloads.borrow_mut().push(dest.to_path_buf());
        if self.fail_download {
            anyhow::bail!("connection reset while fetching {url}");
        }
        fs::write(dest, &self.image)?;
        Ok(self.image.len() as u64)
    }
}

/// Answers list prompts from a queue; an exhausted queue cancels.
pub struct ScriptedMenu {
    pub responses: VecDeque<Selection>,
    pub confirm: Option<bool>,
    /// Titles of the prompts shown, in order.
    pub prompts: Vec<String>,
}

impl ScriptedMenu {
    pub fn new(responses: Vec<Selection>) -> Self {
        Self {
            responses: responses.into(),
            confirm: Some(true),
            prompts: Vec::new(),
        }
    }
}

impl Menu for ScriptedMenu {
    fn yes_no(&mut self, title: &str, _text: &str) -> Result<Option<bool>> {
        self.prompts.push(title.to_string());
        Ok(self.confirm)
    }

    fn radiolist(&mut self, title: &str, _text: &str, _items: &[MenuItem]) -> Result<Selection> {
        self.prompts.push(title.to_string());
        Ok(self.responses.pop_front().unwrap_or(Selection::Cancelled))
    }
}

pub struct FakeUsb(pub String);

impl UsbSource for FakeUsb {
    fn list(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Records every call as a short string, e.g. `set 100 --boot order=scsi0`.
pub struct FakeHypervisor {
    pub vmid: u32,
    pub storages: Vec<StorageTarget>,
    pub vm_config: String,
    status: Cell<VmStatus>,
    failing: RefCell<Vec<&'static str>>,
    interrupting: RefCell<Vec<&'static str>>,
    calls: RefCell<Vec<String>>,
}

impl FakeHypervisor {
    pub fn new() -> Self {
        Self {
            vmid: 100,
            storages: vec![StorageTarget {
                id: "local-lvm".to_string(),
                backend: "lvmthin".to_string(),
                free_kib: 356276608,
            }],
            vm_config: "cores: 2\nname: appliance\nsata0: local-lvm:vm-100-disk-0,size=6G\n"
                .to_string(),
            status: Cell::new(VmStatus::Stopped),
            failing: RefCell::new(Vec::new()),
            interrupting: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn set_status(&self, status: VmStatus) {
        self.status.set(status);
    }

    /// Make every call of operation `op` fail with exit code 5.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.borrow_mut().push(op);
    }

    /// Raise the interrupt flag while operation `op` runs, as a signal
    /// arriving during a long `qm` call would. The call itself succeeds.
    pub fn interrupt_on(&self, op: &'static str) {
        self.interrupting.borrow_mut().push(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    fn record(&self, op: &'static str, call: String) -> Result<()> {
        self.calls.borrow_mut().push(call.clone());
        if self.interrupting.borrow().contains(&op) {
            crate::INTERRUPTED.store(true, Ordering::Relaxed);
        }
        if self.failing.borrow().contains(&op) {
            return Err(CommandError {
                command: format!("qm {call}"),
                code: Some(5),
                status: "exit status: 5".to_string(),
                stderr: format!("{op} failed"),
            }
            .into());
        }
        Ok(())
    }
}

impl Hypervisor for FakeHypervisor {
    fn next_vmid(&self) -> Result<u32> {
        self.record("nextid", "nextid".to_string())?;
        Ok(self.vmid)
    }

    fn storage_status(&self) -> Result<Vec<StorageTarget>> {
        self.record("storage", "storage".to_string())?;
        Ok(self.storages.clone())
    }

    fn vm_status(&self, vmid: u32) -> Result<VmStatus> {
        self.record("status", format!("status {vmid}"))?;
        Ok(self.status.get())
    }

    fn stop(&self, vmid: u32) -> Result<()> {
        self.record("stop", format!("stop {vmid}"))?;
        self.status.set(VmStatus::Stopped);
        Ok(())
    }

    fn destroy(&self, vmid: u32) -> Result<()> {
        self.record("destroy", format!("destroy {vmid}"))
    }

    fn import_ovf(&self, vmid: u32, ovf: &Path, storage: &str, format: ImportFormat) -> Result<()> {
        let file = ovf.file_name().unwrap_or_default().to_string_lossy();
        let mut call = format!("importovf {vmid} {file} {storage}");
        if format == ImportFormat::Qcow2 {
            call.push_str(" --format qcow2");
        }
        self.record("importovf", call)
    }

    fn vm_config(&self, vmid: u32) -> Result<String> {
        self.record("config", format!("config {vmid}"))?;
        Ok(self.vm_config.clone())
    }

    fn set(&self, vmid: u32, args: &[String]) -> Result<()> {
        self.record("set", format!("set {vmid} {}", args.join(" ")))
    }

    fn resize(&self, vmid: u32, disk: &str, size: &str) -> Result<()> {
        self.record("resize", format!("resize {vmid} {disk} {size}"))
    }
}

//! The end-to-end `create` run: catalog, operator choices, provisioning,
//! and rollback when provisioning fails.

use anyhow::Result;

use crate::catalog::{self, ReleaseSource};
use crate::check_interrupted;
use crate::cleanup::{self, WorkDir};
use crate::config::Config;
use crate::menu::Menu;
use crate::provision::{self, Session};
use crate::pve::Hypervisor;
use crate::select;
use crate::usb::{self, UsbSource};

/// The collaborators of one run.
pub struct Workflow<'a> {
    pub config: &'a Config,
    pub hypervisor: &'a dyn Hypervisor,
    pub releases: &'a dyn ReleaseSource,
    pub usb: &'a dyn UsbSource,
    pub menu: &'a mut dyn Menu,
}

impl Workflow<'_> {
    /// Run the whole workflow and return the id of the created VM.
    ///
    /// The work directory is removed on every path. If provisioning fails
    /// after a VM id was allocated, the VM is rolled back before the
    /// original error is returned. A signal received before provisioning
    /// starts ends the run without touching the hypervisor.
    pub fn create(&mut self) -> Result<u32> {
        select::confirm(self.menu)?;
        check_interrupted()?;

        let catalog = catalog::fetch(self.releases, self.config)?;
        check_interrupted()?;
        let release = select::release(self.menu, &catalog)?;
        check_interrupted()?;
        eprintln!("✓ Selected {} {}", release.kind, release.version);

        let storages = self.hypervisor.storage_status()?;
        check_interrupted()?;
        let storage = select::storage(self.menu, &storages)?;
        check_interrupted()?;
        eprintln!("✓ Using storage {}", storage.id);

        let listing = self.usb.list()?;
        let candidates = usb::candidates(&listing, &self.config.usb_allow_list);
        let usb = select::usb(self.menu, &candidates)?;
        check_interrupted()?;

        let mut session = Session {
            vmid: None,
            release,
            storage,
            usb,
            work_dir: WorkDir::create()?,
        };
        match provision::run(self.hypervisor, self.releases, &mut session, self.config) {
            Ok(vmid) => {
                tracing::info!("created VM {vmid}");
                Ok(vmid)
            }
            Err(e) => {
                if let Some(vmid) = session.vmid {
                    cleanup::rollback(self.hypervisor, vmid);
                }
                Err(e)
            }
        }
    }
}

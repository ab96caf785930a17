//! The operator's choices: confirmation, release, storage and USB device.
//!
//! Every prompt treats cancellation as a request to abort the whole run and
//! returns [`ProvisionError::Cancelled`]; no hypervisor resource exists yet
//! at any of these points.

use anyhow::{bail, Result};

use crate::catalog::ReleaseEntry;
use crate::error::ProvisionError;
use crate::format::kib_to_human;
use crate::menu::{Menu, MenuItem, Selection};
use crate::pve::StorageTarget;
use crate::usb::UsbCandidate;

/// Ask whether to go ahead at all.
pub fn confirm(menu: &mut dyn Menu) -> Result<()> {
    match menu.yes_no(
        "New VM",
        "This will create a new virtual machine from an upstream release. Proceed?",
    )? {
        Some(true) => Ok(()),
        Some(false) | None => Err(ProvisionError::Cancelled.into()),
    }
}

/// Map a chosen tag back to its index.
fn index_of(tag: &str, len: usize) -> Result<usize> {
    match tag.parse::<usize>() {
        Ok(i) if i < len => Ok(i),
        _ => bail!("menu returned unknown choice {tag:?}"),
    }
}

pub fn release(menu: &mut dyn Menu, catalog: &[ReleaseEntry]) -> Result<ReleaseEntry> {
    if catalog.is_empty() {
        bail!("no installable releases found");
    }
    let items: Vec<MenuItem> = catalog
        .iter()
        .enumerate()
        .map(|(i, entry)| MenuItem {
            tag: i.to_string(),
            label: entry.label(),
            selected: i == 0,
        })
        .collect();
    loop {
        match menu.radiolist("Releases", "Select the version to install", &items)? {
            Selection::Chosen(tag) => return Ok(catalog[index_of(&tag, catalog.len())?].clone()),
            // Radio lists always carry a selection; ask again if the widget
            // came back empty.
            Selection::Nothing => continue,
            Selection::Cancelled => return Err(ProvisionError::Cancelled.into()),
        }
    }
}

pub fn storage_label(target: &StorageTarget) -> String {
    format!("Type: {} Free: {}", target.backend, kib_to_human(target.free_kib))
}

/// Pick the storage for the VM disk. A single candidate is taken without
/// asking.
pub fn storage(menu: &mut dyn Menu, targets: &[StorageTarget]) -> Result<StorageTarget> {
    match targets {
        [] => return Err(ProvisionError::NoStorageAvailable.into()),
        [only] => {
            tracing::info!("using only available storage {}", only.id);
            return Ok(only.clone());
        }
        _ => {}
    }
    let items: Vec<MenuItem> = targets
        .iter()
        .map(|t| MenuItem {
            tag: t.id.clone(),
            label: storage_label(t),
            selected: false,
        })
        .collect();
    loop {
        match menu.radiolist(
            "Storage Pools",
            "Which storage pool should hold the VM disk?\n\
             Use the spacebar to select, then confirm.",
            &items,
        )? {
            Selection::Chosen(tag) => {
                let Some(target) = targets.iter().find(|t| t.id == tag) else {
                    bail!("menu returned unknown storage {tag:?}");
                };
                return Ok(target.clone());
            }
            Selection::Nothing => continue,
            Selection::Cancelled => return Err(ProvisionError::Cancelled.into()),
        }
    }
}

/// Offer allow-listed USB devices for pass-through. No candidates or an
/// empty selection means no device.
pub fn usb(menu: &mut dyn Menu, candidates: &[UsbCandidate]) -> Result<Option<UsbCandidate>> {
    if candidates.is_empty() {
        tracing::info!("no supported USB devices attached");
        return Ok(None);
    }
    let items: Vec<MenuItem> = candidates
        .iter()
        .map(|c| MenuItem {
            tag: c.id.clone(),
            label: c.description.clone(),
            selected: false,
        })
        .collect();
    match menu.radiolist(
        "USB Devices",
        "Select a USB device to pass through to the VM (optional)",
        &items,
    )? {
        Selection::Chosen(tag) => match candidates.iter().find(|c| c.id == tag) {
            Some(dev) => Ok(Some(dev.clone())),
            None => bail!("menu returned unknown USB device {tag:?}"),
        },
        Selection::Nothing => Ok(None),
        Selection::Cancelled => Err(ProvisionError::Cancelled.into()),
    }
}

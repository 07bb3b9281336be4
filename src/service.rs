//! Service surface (C8, spec.md §4.8).
//!
//! Grounded on `original_source/fsp-usb/source/fspusb_service.hpp`'s five
//! ordinally-numbered commands. There each forces `impl::DoUpdateDrives()`
//! before validating the caller's interface id against the live manager
//! state; the same shape is kept here minus the IPC dispatch-table
//! machinery (`fspusb_main.cpp`'s service-process bootstrap and the
//! Switch-specific SF command marshaling), which spec.md's Non-goals
//! explicitly exclude.

use crate::error::{Error, Result};
use crate::fat::Filesystem;
use crate::manager::Manager;
use crate::usb::platform::InterfaceId;
use std::sync::Arc;

/// The five-operation RPC surface spec.md §4.8 names, each forcing a
/// drive-list refresh before touching manager state.
pub struct Service {
    manager: Arc<Manager>,
}

impl Service {
    pub fn new(manager: Arc<Manager>) -> Self {
        Self { manager }
    }

    /// Command 0: fills `out` with up to `out.len()` mounted interface ids,
    /// returning the actual mounted-drive count (spec.md §4.8 operation 0).
    pub fn list_mounted_drives(&self, out: &mut [InterfaceId]) -> usize {
        self.manager.force_update();
        let count = self.manager.count();
        let filled = count.min(out.len());
        for (slot, out_id) in out.iter_mut().take(filled).enumerate() {
            if let Some(id) = self.manager.interface_id_at(slot) {
                *out_id = id;
            }
        }
        count
    }

    fn require_valid(&self, interface_id: InterfaceId) -> Result<()> {
        self.manager.force_update();
        if self.manager.is_valid(interface_id) {
            Ok(())
        } else {
            Err(Error::InvalidDriveInterfaceId)
        }
    }

    /// Command 1: FAT filesystem type of the volume mounted under
    /// `interface_id` (spec.md §4.8 operation 1).
    pub fn get_filesystem_type(&self, interface_id: InterfaceId) -> Result<u8> {
        self.require_valid(interface_id)?;
        self.manager
            .with_drive_by_iface(interface_id, |drive| Filesystem::new(drive.clone()).filesystem_type())
            .ok_or(Error::DriveUnavailable)?
    }

    /// Command 2: FAT volume label on the mount name for `interface_id`
    /// (spec.md §4.8 operation 2, "FAT get-label on the mount name").
    pub fn get_label(&self, interface_id: InterfaceId) -> Result<String> {
        self.require_valid(interface_id)?;
        self.manager
            .with_drive_by_iface(interface_id, |drive| Filesystem::new(drive.clone()).label())
            .ok_or(Error::DriveUnavailable)?
    }

    /// Command 3: sets the volume label, truncated to 11 characters per
    /// spec.md §4.8's "labels are limited to 11 characters".
    pub fn set_label(&self, interface_id: InterfaceId, label: &str) -> Result<()> {
        self.require_valid(interface_id)?;
        self.manager
            .with_drive_by_iface(interface_id, |drive| Filesystem::new(drive.clone()).set_label(label))
            .ok_or(Error::DriveUnavailable)?
    }

    /// Command 4: hands back a [`Filesystem`] bound to the drive mounted
    /// under `interface_id` (spec.md §4.8 operation 4); the caller drives
    /// every subsequent file/directory operation through it.
    pub fn open_filesystem(&self, interface_id: InterfaceId) -> Result<Filesystem> {
        self.require_valid(interface_id)?;
        self.manager
            .with_drive_by_iface(interface_id, |drive| Filesystem::new(drive.clone()))
            .ok_or(Error::DriveUnavailable)
    }
}

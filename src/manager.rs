//! Drive manager (C6, spec.md §4.6).
//!
//! Grounded on `original_source/fsp-usb/source/impl/fspusb_usb_manager.cpp`'s
//! `InitializeManager`/`UpdateDrives`/`ManagerUpdateThread`/`FinalizeManager`.
//! The original's three-way `waitMulti` (interface-state-change,
//! interface-available, thread-exit) becomes a loop that checks a
//! `Mutex<bool>` exit flag before each call to [`UsbHost::wait_hotplug`] —
//! `wait_hotplug` itself folds the platform's first two events into one
//! trait method, since both just mean "re-run `update_drives`"; only the
//! exit signal needs to interrupt the loop from the outside, and nothing
//! about its manual/auto-clear distinction survives past that point.

use crate::config::{Config, DRIVE_MAX};
use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::usb::filter::{mass_storage_filter, InterfaceFilter};
use crate::usb::platform::{EndpointDescriptor, EndpointDirection, HotplugSignal, InterfaceId, UsbHost};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

struct ExitSignal {
    flag: Mutex<bool>,
    cvar: Condvar,
}

/// Hotplug detection, mount-slot arbitration and lookup across all currently
/// mounted drives (spec.md §3 "the drive manager").
pub struct Manager {
    host: Arc<dyn UsbHost>,
    cfg: Config,
    filter: InterfaceFilter,
    drives: Mutex<Vec<Arc<Drive>>>,
    slots: Mutex<[bool; DRIVE_MAX]>,
    exit: Arc<ExitSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Installs the mass-storage filter and launches the background update
    /// thread (spec.md §4.6 "initialize()").
    pub fn initialize(host: Arc<dyn UsbHost>, cfg: Config) -> Arc<Self> {
        let manager = Arc::new(Self {
            host,
            cfg,
            filter: mass_storage_filter(),
            drives: Mutex::new(Vec::new()),
            slots: Mutex::new([false; DRIVE_MAX]),
            exit: Arc::new(ExitSignal {
                flag: Mutex::new(false),
                cvar: Condvar::new(),
            }),
            thread: Mutex::new(None),
        });

        let worker = manager.clone();
        let handle = std::thread::spawn(move || worker.update_loop());
        *manager.thread.lock().unwrap() = Some(handle);
        manager
    }

    fn update_loop(&self) {
        loop {
            if *self.exit.flag.lock().unwrap() {
                return;
            }
            match self.host.wait_hotplug() {
                HotplugSignal::InterfaceStateChange => self.host.clear_interface_state_change(),
                HotplugSignal::InterfaceAvailable => {}
            }
            if *self.exit.flag.lock().unwrap() {
                return;
            }
            self.update_drives();
        }
    }

    /// Unmounts and disposes every drive, signals the update thread to exit
    /// and joins it (spec.md §4.6 "finalize()").
    pub fn finalize(&self) {
        for drive in self.drives.lock().unwrap().drain(..) {
            drive.unmount();
            drive.dispose(true);
        }
        *self.slots.lock().unwrap() = [false; DRIVE_MAX];

        *self.exit.flag.lock().unwrap() = true;
        self.exit.cvar.notify_all();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Runs one update pass synchronously, outside the background thread's
    /// own cadence. Used by tests and by callers that want a fresh view
    /// before an RPC (spec.md §4.8: "forces a drive-list update first").
    pub fn force_update(&self) {
        self.update_drives();
    }

    fn find_and_mount_slot(&self) -> Option<usize> {
        let mut slots = self.slots.lock().unwrap();
        let idx = slots.iter().position(|used| !used)?;
        slots[idx] = true;
        Some(idx)
    }

    fn release_slot(&self, slot: usize) {
        let mut slots = self.slots.lock().unwrap();
        if slot < slots.len() {
            slots[slot] = false;
        }
    }

    /// Prune-then-admit pass (spec.md §4.6 "update_drives()").
    fn update_drives(&self) {
        let mut drives = self.drives.lock().unwrap();

        if !drives.is_empty() {
            let acquired: HashSet<InterfaceId> =
                self.host.enumerate_acquired().into_iter().map(|h| h.id).collect();
            let mut kept = Vec::with_capacity(drives.len());
            for drive in drives.drain(..) {
                if acquired.contains(&drive.interface_id()) {
                    kept.push(drive);
                } else {
                    let slot = drive.mounted_index();
                    drive.unmount();
                    drive.dispose(true);
                    if let Some(slot) = slot {
                        self.release_slot(slot);
                    }
                    log::debug!("interface {}: pruned, no longer acquired", drive.interface_id());
                }
            }
            *drives = kept;
        }

        let available = self.host.enumerate_available(&self.filter);
        for handle in available {
            let id = handle.id;
            if self.host.acquire_interface(id).is_err() {
                continue;
            }

            let in_desc = handle.endpoints.iter().find(|e| e.direction == EndpointDirection::In).copied();
            let out_desc = handle.endpoints.iter().find(|e| e.direction == EndpointDirection::Out).copied();
            let (in_desc, out_desc) = match (in_desc, out_desc) {
                (Some(i), Some(o)) => (i, o),
                _ => {
                    log::warn!("interface {id}: missing bulk in/out endpoint descriptor");
                    self.host.close_interface(id);
                    continue;
                }
            };

            let desired_config = handle.desired_config;
            let alt_setting = handle.descriptor.alternate_setting;
            if !self.admit_interface(id, in_desc, out_desc, desired_config, alt_setting, &mut drives) {
                self.host.close_interface(id);
            }
        }
    }

    /// Negotiates config/alt-setting, opens both bulk endpoints, probes each
    /// LUN in turn, and mounts the first one that succeeds. Returns whether
    /// any drive was admitted (so the caller knows whether to close the
    /// interface on the way out).
    fn admit_interface(
        &self,
        id: InterfaceId,
        in_desc: EndpointDescriptor,
        out_desc: EndpointDescriptor,
        desired_config: u8,
        alt_setting: u8,
        drives: &mut Vec<Arc<Drive>>,
    ) -> bool {
        let mut needs_reset = false;
        if let Ok(current) = self.host.get_config(id) {
            if current != desired_config && self.host.set_config(id, desired_config).is_ok() {
                needs_reset = true;
            }
        }
        if alt_setting != 0 && self.host.set_alt_setting(id, alt_setting).is_ok() {
            needs_reset = true;
        }

        let in_ep = match self.host.open_endpoint(id, in_desc) {
            Ok(ep) => ep,
            Err(_) => return false,
        };
        let out_ep = match self.host.open_endpoint(id, out_desc) {
            Ok(ep) => ep,
            Err(_) => {
                self.host.close_endpoint(in_ep);
                return false;
            }
        };

        if needs_reset {
            crate::usb::bulk::bulk_only_reset(self.host.as_ref(), id, in_desc, out_desc, &self.cfg);
        }

        let max_lun = crate::usb::bulk::get_max_lun(self.host.as_ref(), id, &self.cfg);
        crate::usb::bulk::clear_endpoint_halt(self.host.as_ref(), id, in_desc, &self.cfg);
        crate::usb::bulk::clear_endpoint_halt(self.host.as_ref(), id, out_desc, &self.cfg);

        for lun in 0..max_lun {
            let Some(drive) = Drive::new(self.host.clone(), id, in_ep, in_desc, out_ep, out_desc, lun, &self.cfg)
            else {
                continue;
            };
            let drive = Arc::new(drive);
            let Some(slot) = self.find_and_mount_slot() else {
                drive.dispose(false);
                break;
            };
            match drive.mount(slot) {
                Ok(()) => {
                    log::debug!("interface {id}: mounted LUN {lun} at slot {slot}");
                    drives.push(drive);
                    return true;
                }
                Err(_) => {
                    self.release_slot(slot);
                    drive.dispose(false);
                }
            }
        }

        self.host.close_endpoint(in_ep);
        self.host.close_endpoint(out_ep);
        false
    }

    /// Number of currently mounted drives (spec.md §4.6 "count()").
    pub fn count(&self) -> usize {
        self.drives.lock().unwrap().len()
    }

    /// Interface id of the mounted drive at `mounted_index`, if any (spec.md
    /// §4.6 "interface_id_at(index)").
    pub fn interface_id_at(&self, mounted_index: usize) -> Option<InterfaceId> {
        self.drives
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.mounted_index() == Some(mounted_index))
            .map(|d| d.interface_id())
    }

    /// Mounted index of the drive with `interface_id`, if mounted (spec.md
    /// §4.6 "mounted_index_of(interface_id)").
    pub fn mounted_index_of(&self, interface_id: InterfaceId) -> Option<usize> {
        self.drives
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.interface_id() == interface_id)
            .and_then(|d| d.mounted_index())
    }

    /// Whether `interface_id` currently names a mounted drive (spec.md §4.6
    /// "is_valid(interface_id)").
    pub fn is_valid(&self, interface_id: InterfaceId) -> bool {
        self.drives.lock().unwrap().iter().any(|d| d.interface_id() == interface_id)
    }

    /// Runs `f` against the mounted drive with `interface_id` under the
    /// manager lock (spec.md §4.6 `DoWithDrive`, keyed by interface id per
    /// the §8 scenario wording rather than by vector index, so a lookup
    /// survives prune/admit reordering the backing vector).
    pub fn with_drive_by_iface<R>(&self, interface_id: InterfaceId, f: impl FnOnce(&Arc<Drive>) -> R) -> Option<R> {
        let drives = self.drives.lock().unwrap();
        drives.iter().find(|d| d.interface_id() == interface_id).map(f)
    }

    /// As [`Manager::with_drive_by_iface`], but by mount slot.
    pub fn with_drive_by_slot<R>(&self, slot: usize, f: impl FnOnce(&Arc<Drive>) -> R) -> Option<R> {
        let drives = self.drives.lock().unwrap();
        drives.iter().find(|d| d.mounted_index() == Some(slot)).map(f)
    }

    /// Resolves `interface_id` to a mounted `Drive`, erroring per spec.md §7
    /// if it isn't currently mounted.
    pub fn resolve(&self, interface_id: InterfaceId) -> Result<Arc<Drive>> {
        self.drives
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.interface_id() == interface_id)
            .cloned()
            .ok_or(Error::InvalidDriveInterfaceId)
    }
}

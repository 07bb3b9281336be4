//! Drive (C5, spec.md §4.5).
//!
//! Grounded on `original_source/fsp-usb/source/impl/fspusb_drive.cpp`'s
//! `Drive::Mount`/`Unmount`/`Dispose`. The FAT volume itself is the "embedded
//! FAT library" external collaborator spec.md §6 names; here that role is
//! played by the real `fatfs` crate, with [`DriveVolume`] as the
//! `Read + Write + Seek` disk this crate furnishes it (the
//! `status`/`initialize`/`read`/`write`/`ioctl` disk-IO contract spec.md §6
//! describes, expressed through `fatfs`'s trait instead of a raw pdrv table).

use crate::config::Config;
use crate::error::{Error, Result};
use crate::scsi::{Block, Device};
use crate::usb::platform::{EndpointDescriptor, EndpointHandle, InterfaceId, UsbHost};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

/// The `Read + Write + Seek` disk adapter `fatfs` mounts over (spec.md §4.5
/// "Sector IO for the FAT library: bridge from FAT→Drive→SCSI").
pub struct DriveVolume {
    block: Block,
    position: u64,
}

impl DriveVolume {
    fn block_size(&self) -> u64 {
        self.block.block_size() as u64
    }

    fn capacity(&self) -> u64 {
        self.block.capacity()
    }
}

fn scsi_io_error() -> io::Error {
    io::Error::other("SCSI transfer failed")
}

/// `fatfs::FsOptions` carries `&'static dyn OemCpConverter`/`&'static dyn
/// TimeProvider` references; neither trait declares a `Sync` bound, so the
/// compiler can't prove `FileSystem<T>: Send` even though the crate's
/// default converters (`LossyOemCpConverter`, its default time provider) are
/// stateless statics with no interior mutability. Every access to the
/// wrapped filesystem already goes through `Drive::fat_volume`'s `Mutex`, so
/// nothing ever touches it from two threads at once; the `unsafe impl`s just
/// tell the compiler what's already true of the access pattern.
struct SyncFileSystem(fatfs::FileSystem<DriveVolume>);
unsafe impl Send for SyncFileSystem {}
unsafe impl Sync for SyncFileSystem {}

impl Read for DriveVolume {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.block_size();
        let start_lba = self.position / bs;
        let offset = (self.position % bs) as usize;
        let end = (self.position + buf.len() as u64).min(self.capacity());
        if end <= self.position {
            return Ok(0);
        }
        let end_lba = end.div_ceil(bs);
        let count = (end_lba - start_lba) as u32;

        let mut tmp = vec![0u8; (count as u64 * bs) as usize];
        let got = self
            .block
            .read_sectors(&mut tmp, start_lba, count)
            .map_err(|_| scsi_io_error())?;
        if got == 0 {
            return Err(scsi_io_error());
        }

        let avail = tmp.len().saturating_sub(offset);
        let n = buf.len().min(avail);
        buf[..n].copy_from_slice(&tmp[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for DriveVolume {
    /// Read-modify-write: reads the spanning sectors, overlays `buf`, writes
    /// the sectors back. Not the fastest path, but the block layer only
    /// exposes whole-sector transfers, and FAT metadata writes are small.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.block_size();
        let start_lba = self.position / bs;
        let offset = (self.position % bs) as usize;
        let end = self.position + buf.len() as u64;
        let end_lba = end.div_ceil(bs);
        let count = (end_lba - start_lba) as u32;

        let mut tmp = vec![0u8; (count as u64 * bs) as usize];
        let got = self
            .block
            .read_sectors(&mut tmp, start_lba, count)
            .map_err(|_| scsi_io_error())?;
        if got == 0 {
            return Err(scsi_io_error());
        }

        tmp[offset..offset + buf.len()].copy_from_slice(buf);

        let written = self
            .block
            .write_sectors(&mut tmp, start_lba, count)
            .map_err(|_| scsi_io_error())?;
        if written == 0 {
            return Err(scsi_io_error());
        }

        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    /// Writes are synchronous (spec.md §4.7 "flush flag implies a no-op").
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for DriveVolume {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let capacity = self.capacity() as i64;
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(p) => capacity + p,
            SeekFrom::Current(p) => self.position as i64 + p,
        };
        if new_pos < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "negative seek position"));
        }
        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// One mounted (or not-yet-mounted) USB mass-storage volume (spec.md §3
/// "Drive").
pub struct Drive {
    interface_id: InterfaceId,
    host: Arc<dyn UsbHost>,
    in_ep: EndpointHandle,
    out_ep: EndpointHandle,
    mounted_index: Mutex<Option<usize>>,
    mount_name: Mutex<Option<String>>,
    /// The per-volume lock (spec.md §5 `fs_lock`): serializes every FAT
    /// library call against this volume, and with it, every `transfer_command`
    /// issued on its behalf (consequence noted in §5's ordering guarantees).
    fat_volume: Mutex<Option<SyncFileSystem>>,
    /// The negotiated block layer, held here until `mount()` moves it into a
    /// [`DriveVolume`]; `None` thereafter, or if initial negotiation failed.
    pending_block: Mutex<Option<Block>>,
    /// In-memory override for the volume label (spec.md §4.8 `set_label`).
    /// `fatfs` 0.3 exposes no API to rewrite a live volume's label, so this
    /// crate layers an override on top rather than touching the BPB
    /// directly; see DESIGN.md.
    label_override: Mutex<Option<String>>,
}

impl Drive {
    /// Constructs a SCSI context for `lun` and attempts to build its block
    /// layer (spec.md §4.5 "Constructor ... attempts to build a block layer
    /// for that LUN").
    pub fn new(
        host: Arc<dyn UsbHost>,
        interface_id: InterfaceId,
        in_ep: EndpointHandle,
        in_ep_desc: EndpointDescriptor,
        out_ep: EndpointHandle,
        out_ep_desc: EndpointDescriptor,
        lun: u8,
        cfg: &Config,
    ) -> Option<Self> {
        let device = Device::new(host.clone(), interface_id, in_ep, in_ep_desc, out_ep, out_ep_desc, lun)?;
        let block = Block::new(device, cfg);
        Some(Self {
            interface_id,
            host,
            in_ep,
            out_ep,
            mounted_index: Mutex::new(None),
            mount_name: Mutex::new(None),
            fat_volume: Mutex::new(None),
            pending_block: Mutex::new(Some(block)),
            label_override: Mutex::new(None),
        })
    }

    pub fn interface_id(&self) -> InterfaceId {
        self.interface_id
    }

    pub fn mounted_index(&self) -> Option<usize> {
        *self.mounted_index.lock().unwrap()
    }

    pub fn mount_name(&self) -> Option<String> {
        self.mount_name.lock().unwrap().clone()
    }

    pub fn is_mounted(&self) -> bool {
        self.fat_volume.lock().unwrap().is_some()
    }

    /// Whether the SCSI handshake that ran at construction succeeded.
    pub fn block_healthy(&self) -> bool {
        match self.pending_block.lock().unwrap().as_ref() {
            Some(block) => block.ok(),
            None => self.is_mounted(),
        }
    }

    /// Mounts the FAT volume at `slot` (spec.md §4.5 "mount()"). Idempotent:
    /// a no-op returning success if already mounted.
    pub fn mount(&self, slot: usize) -> Result<()> {
        if self.is_mounted() {
            return Ok(());
        }

        let mut pending = self.pending_block.lock().unwrap();
        let block = pending.take().ok_or(Error::DriveInitializationFailure)?;
        if !block.ok() {
            *pending = Some(block);
            return Err(Error::DriveInitializationFailure);
        }

        let volume = DriveVolume { block, position: 0 };
        let options = fatfs::FsOptions::new();
        let fs = match fatfs::FileSystem::new(volume, options) {
            Ok(fs) => fs,
            Err(err) => {
                log::warn!("interface {}: FAT mount failed: {err}", self.interface_id);
                return Err(Error::from(err));
            }
        };

        *self.fat_volume.lock().unwrap() = Some(SyncFileSystem(fs));
        *self.mounted_index.lock().unwrap() = Some(slot);
        *self.mount_name.lock().unwrap() = Some(format!("{slot}:"));
        log::debug!("interface {}: mounted at slot {slot}", self.interface_id);
        Ok(())
    }

    /// Unmounts the FAT volume and releases the volume's resources (spec.md
    /// §4.5 "unmount()"). The mount slot itself is released by the caller
    /// (the manager owns the slot table).
    pub fn unmount(&self) {
        let fs = self.fat_volume.lock().unwrap().take();
        drop(fs);
        *self.mounted_index.lock().unwrap() = None;
        *self.mount_name.lock().unwrap() = None;
    }

    /// Tears down the SCSI context. If `close_usb`, also resets the device
    /// and closes the endpoints and interface (spec.md §4.5 "dispose()").
    /// The manager passes `close_usb=false` only when a failed admission
    /// must not collide with a device already disconnected mid-enumeration.
    pub fn dispose(&self, close_usb: bool) {
        self.unmount();
        self.pending_block.lock().unwrap().take();
        if close_usb {
            self.host.reset_device(self.interface_id);
            self.host.close_endpoint(self.in_ep);
            self.host.close_endpoint(self.out_ep);
            self.host.close_interface(self.interface_id);
        }
    }

    /// Runs `f` against the mounted FAT volume under the per-volume lock —
    /// the only legal entry point for FAT calls against this volume (spec.md
    /// §4.5 "do_with_fat(f)").
    pub fn do_with_fat<R>(&self, f: impl FnOnce(&fatfs::FileSystem<DriveVolume>) -> R) -> Option<R> {
        let guard = self.fat_volume.lock().unwrap();
        guard.as_ref().map(|wrapper| f(&wrapper.0))
    }

    /// Formats a fresh FAT16 volume over the pending block, then mounts it
    /// at `slot`. Test/bring-up helper only; production mounts never format
    /// an existing volume.
    #[cfg(test)]
    pub fn format_and_mount(&self, slot: usize) -> Result<()> {
        let mut pending = self.pending_block.lock().unwrap();
        let block = pending.take().ok_or(Error::DriveInitializationFailure)?;
        let mut volume = DriveVolume { block, position: 0 };
        // format_volume takes its disk by value; pass a `&mut` reference
        // (std's blanket Read/Write/Seek impls for `&mut T` make it satisfy
        // `ReadWriteSeek` too) so `volume` itself survives to be mounted.
        fatfs::format_volume(&mut volume, fatfs::FormatVolumeOptions::new().fat_type(fatfs::FatType::Fat16))
            .map_err(Error::from)?;
        volume.seek(SeekFrom::Start(0)).map_err(Error::from)?;

        let fs = fatfs::FileSystem::new(volume, fatfs::FsOptions::new()).map_err(Error::from)?;
        *self.fat_volume.lock().unwrap() = Some(SyncFileSystem(fs));
        *self.mounted_index.lock().unwrap() = Some(slot);
        *self.mount_name.lock().unwrap() = Some(format!("{slot}:"));
        Ok(())
    }

    /// Current label override, if `set_label_override` has been called
    /// since mount (spec.md §4.8 `set_label`).
    pub fn label_override(&self) -> Option<String> {
        self.label_override.lock().unwrap().clone()
    }

    pub fn set_label_override(&self, label: String) {
        *self.label_override.lock().unwrap() = Some(label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::platform::EndpointDirection;
    use crate::usb::test_support::FakeUsbHost;

    fn mountable_drive() -> Drive {
        let host = Arc::new(FakeUsbHost::with_disk(512, 0x4000));
        host.acquire_interface(0).unwrap();
        let in_desc = EndpointDescriptor {
            address: 1,
            direction: EndpointDirection::In,
            max_packet_size: 512,
        };
        let out_desc = EndpointDescriptor {
            address: 2,
            direction: EndpointDirection::Out,
            max_packet_size: 512,
        };
        let in_ep = host.open_endpoint(0, in_desc).unwrap();
        let out_ep = host.open_endpoint(0, out_desc).unwrap();
        let host: Arc<dyn UsbHost> = host;
        let cfg = Config::default();
        Drive::new(host, 0, in_ep, in_desc, out_ep, out_desc, 0, &cfg).unwrap()
    }

    #[test]
    fn fat_format_then_mount_round_trips_a_file() {
        let drive = mountable_drive();
        assert!(drive.block_healthy());

        drive.format_and_mount(0).unwrap();
        assert!(drive.is_mounted());
        assert_eq!(drive.mounted_index(), Some(0));

        drive
            .do_with_fat(|fs| {
                let root = fs.root_dir();
                let mut file = root.create_file("hello.txt").unwrap();
                file.write_all(b"round trip").unwrap();
            })
            .unwrap();

        let contents = drive
            .do_with_fat(|fs| {
                let root = fs.root_dir();
                let mut file = root.open_file("hello.txt").unwrap();
                let mut buf = Vec::new();
                file.read_to_end(&mut buf).unwrap();
                buf
            })
            .unwrap();
        assert_eq!(contents, b"round trip");
    }
}

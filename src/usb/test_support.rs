//! In-process `UsbHost` double simulating a BBB/SCSI mass-storage device,
//! used by this crate's own tests to exercise §8's scenarios without real
//! hardware. Mirrors the shape of a hand-rolled hardware mock, not a
//! general-purpose USB simulator: only the requests this crate actually
//! issues are understood.

use super::filter::{InterfaceDescriptor, InterfaceFilter};
use super::platform::{
    ControlTransfer, EndpointDescriptor, EndpointDirection, EndpointHandle, HotplugSignal,
    InterfaceHandle, InterfaceId, UsbHost,
};
use crate::error::UsbError;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

const REQ_GET_MAX_LUN: u8 = 0xFE;

const SCSI_INQUIRY: u8 = 0x12;
const SCSI_TEST_UNIT_READY: u8 = 0x00;
const SCSI_REQUEST_SENSE: u8 = 0x03;
const SCSI_READ_CAPACITY_10: u8 = 0x25;
const SCSI_READ_10: u8 = 0x28;
const SCSI_WRITE_10: u8 = 0x2A;
const SCSI_READ_16: u8 = 0x88;
const SCSI_WRITE_16: u8 = 0x8A;
const SCSI_SERVICE_ACTION_IN_16: u8 = 0x9E;

const CBW_SIGNATURE: u32 = 0x4342_5355;
const CSW_SIGNATURE: u32 = 0x5342_5355;

/// A single bulk endpoint's pending response/data queue.
#[derive(Default)]
struct EndpointState {
    descriptor: Option<EndpointDescriptor>,
}

enum PendingWrite {
    None,
    /// Awaiting `remaining` bytes of OUT data before the CSW can be queued,
    /// to be written starting at `lba`, `written` bytes in so far.
    AwaitingData { tag: u32, lba: u64, written: usize, remaining: usize },
}

struct ScsiSim {
    block_size: u32,
    total_blocks: u64,
    storage: Vec<u8>,
    sense_key: u8,
    not_ready_until_nth_poll: u32,
    polls_seen: u32,
    pending_write: PendingWrite,
    /// Remaining commands to fail with CSW status 2 (phase error) before
    /// processing resumes normally, for exercising spec.md §8's S4 scenario.
    fail_with_phase_error_for_n_attempts: u32,
    /// Makes READ CAPACITY(10) report the `0xFFFF_FFFF` sentinel so callers
    /// must promote to READ CAPACITY(16), exercising §8's S3 scenario.
    capacity_sentinel: bool,
}

impl ScsiSim {
    /// Builds the backing store pre-formatted with a FAT volume, matching a
    /// real USB mass-storage stick shipped from the factory already
    /// formatted rather than a blank run of zeros.
    fn new(block_size: u32, total_blocks: u64) -> Self {
        let mut storage = vec![0u8; (block_size as u64 * total_blocks) as usize];
        let mut cursor = std::io::Cursor::new(&mut storage[..]);
        let _ = fatfs::format_volume(&mut cursor, fatfs::FormatVolumeOptions::new());
        Self {
            block_size,
            total_blocks,
            storage,
            sense_key: 0,
            not_ready_until_nth_poll: 0,
            polls_seen: 0,
            pending_write: PendingWrite::None,
            fail_with_phase_error_for_n_attempts: 0,
            capacity_sentinel: false,
        }
    }

    fn handle_cbw(&mut self, cbw: &[u8]) -> VecDeque<u8> {
        let tag = u32::from_le_bytes([cbw[4], cbw[5], cbw[6], cbw[7]]);
        let cb_len = cbw[14] as usize;
        let cdb = &cbw[15..15 + cb_len.max(1)];
        let opcode = cdb[0];

        if self.fail_with_phase_error_for_n_attempts > 0 {
            self.fail_with_phase_error_for_n_attempts -= 1;
            let mut out = VecDeque::new();
            push_csw(&mut out, tag, 2, 0);
            return out;
        }

        let mut out = VecDeque::new();
        let mut data_len = 0usize;
        let mut status = 0u8;

        match opcode {
            SCSI_INQUIRY => {
                let alloc_len = cdb[4] as usize;
                let mut reply = vec![0u8; 36];
                reply[1] = 0x80; // removable media
                reply[8..16].copy_from_slice(b"FAKEUSB ");
                reply[16..32].copy_from_slice(b"SIMULATED DISK  ");
                data_len = alloc_len.min(36);
                out.extend(reply.into_iter().take(data_len));
            }
            SCSI_TEST_UNIT_READY => {
                self.polls_seen += 1;
                if self.polls_seen < self.not_ready_until_nth_poll {
                    status = 1;
                    self.sense_key = 0x02; // NOT READY
                } else {
                    self.sense_key = 0x00;
                }
            }
            SCSI_REQUEST_SENSE => {
                let alloc_len = cdb[4] as usize;
                let mut sense = vec![0u8; alloc_len.max(18)];
                sense[0] = 0x70;
                sense[2] = self.sense_key;
                data_len = alloc_len;
                out.extend(sense.into_iter().take(data_len));
            }
            SCSI_READ_CAPACITY_10 => {
                let last_lba = if self.capacity_sentinel {
                    0xFFFF_FFFFu32
                } else {
                    (self.total_blocks.saturating_sub(1)) as u32
                };
                out.extend(last_lba.to_be_bytes());
                out.extend(self.block_size.to_be_bytes());
                data_len = 8;
            }
            SCSI_SERVICE_ACTION_IN_16 if cdb[1] & 0x1F == 0x10 => {
                let last_lba = self.total_blocks.saturating_sub(1);
                out.extend(last_lba.to_be_bytes());
                out.extend(self.block_size.to_be_bytes());
                out.extend([0u8; 20]);
                data_len = 32;
            }
            SCSI_READ_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as u64;
                data_len = self.read_into(&mut out, lba, count);
            }
            SCSI_READ_16 => {
                let lba = u64::from_be_bytes([
                    cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
                ]);
                let count = u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]) as u64;
                data_len = self.read_into(&mut out, lba, count);
            }
            SCSI_WRITE_10 => {
                let lba = u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]]) as u64;
                let count = u16::from_be_bytes([cdb[7], cdb[8]]) as usize;
                self.pending_write = PendingWrite::AwaitingData {
                    tag,
                    lba,
                    written: 0,
                    remaining: count * self.block_size as usize,
                };
                return out; // CSW deferred until data phase completes
            }
            SCSI_WRITE_16 => {
                let lba = u64::from_be_bytes([
                    cdb[2], cdb[3], cdb[4], cdb[5], cdb[6], cdb[7], cdb[8], cdb[9],
                ]);
                let count = u32::from_be_bytes([cdb[10], cdb[11], cdb[12], cdb[13]]) as usize;
                self.pending_write = PendingWrite::AwaitingData {
                    tag,
                    lba,
                    written: 0,
                    remaining: count * self.block_size as usize,
                };
                return out;
            }
            _ => {
                status = 1;
                self.sense_key = 0x05; // ILLEGAL REQUEST
            }
        }

        push_csw(&mut out, tag, status, 0);
        let _ = data_len;
        out
    }

    fn read_into(&self, out: &mut VecDeque<u8>, lba: u64, count: u64) -> usize {
        // Test-only simulator: LBAs may exceed the backing store's size (the
        // Read16-dispatch tests probe LBAs far past it), so wrap rather than
        // clamp to always return exactly the requested byte count.
        let len = (count * self.block_size as u64) as usize;
        if self.storage.is_empty() || len == 0 {
            return 0;
        }
        let start = ((lba * self.block_size as u64) as usize) % self.storage.len();
        for i in 0..len {
            out.push_back(self.storage[(start + i) % self.storage.len()]);
        }
        len
    }

    fn accept_write_data(&mut self, data: &[u8]) -> Option<VecDeque<u8>> {
        match &mut self.pending_write {
            PendingWrite::AwaitingData { tag, lba, written, remaining } => {
                let tag = *tag;
                let take = data.len().min(*remaining);
                if !self.storage.is_empty() {
                    let base = ((*lba * self.block_size as u64) as usize) % self.storage.len();
                    for (i, byte) in data[..take].iter().enumerate() {
                        let dst = (base + *written + i) % self.storage.len();
                        self.storage[dst] = *byte;
                    }
                }
                *written += take;
                *remaining -= take;
                if *remaining == 0 {
                    self.pending_write = PendingWrite::None;
                    let mut out = VecDeque::new();
                    push_csw(&mut out, tag, 0, 0);
                    Some(out)
                } else {
                    None
                }
            }
            PendingWrite::None => None,
        }
    }
}

fn push_csw(out: &mut VecDeque<u8>, tag: u32, status: u8, residue: u32) {
    out.extend(CSW_SIGNATURE.to_le_bytes());
    out.extend(tag.to_le_bytes());
    out.extend(residue.to_le_bytes());
    out.push_back(status);
}

struct Inner {
    max_lun_response: Option<u8>,
    acquired: std::collections::HashSet<InterfaceId>,
    available: Vec<InterfaceHandle>,
    endpoints: HashMap<EndpointHandle, EndpointState>,
    next_handle: EndpointHandle,
    in_queue: VecDeque<u8>,
    scsi: ScsiSim,
    hotplug: VecDeque<HotplugSignal>,
}

/// A fake USB host simulating a single Bulk-Only/SCSI device for tests.
pub struct FakeUsbHost {
    inner: Mutex<Inner>,
}

impl FakeUsbHost {
    /// A host with no Get Max LUN response configured (simulates a stall).
    pub fn new_unconfigured() -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_lun_response: None,
                acquired: Default::default(),
                available: Vec::new(),
                endpoints: HashMap::new(),
                next_handle: 1,
                in_queue: VecDeque::new(),
                scsi: ScsiSim::new(512, 2048),
                hotplug: VecDeque::new(),
            }),
        }
    }

    /// A host presenting one available mass-storage interface backed by a
    /// `total_blocks * block_size`-byte SCSI disk.
    pub fn with_disk(block_size: u32, total_blocks: u64) -> Self {
        let host = Self::new_unconfigured();
        {
            let mut inner = host.inner.lock().unwrap();
            inner.max_lun_response = Some(0);
            inner.scsi = ScsiSim::new(block_size, total_blocks);
            inner.available.push(InterfaceHandle {
                id: 0,
                descriptor: InterfaceDescriptor {
                    interface_number: 0,
                    alternate_setting: 0,
                    interface_class: super::filter::CLASS_MASS_STORAGE,
                    interface_subclass: super::filter::SUBCLASS_SCSI_TRANSPARENT,
                    interface_protocol: super::filter::PROTOCOL_BULK_ONLY,
                },
                endpoints: vec![
                    EndpointDescriptor {
                        address: 1,
                        direction: EndpointDirection::In,
                        max_packet_size: 512,
                    },
                    EndpointDescriptor {
                        address: 2,
                        direction: EndpointDirection::Out,
                        max_packet_size: 512,
                    },
                ],
                current_config: 0,
                desired_config: 1,
            });
        }
        host
    }

    pub fn set_max_lun_response(&self, value: u8) {
        self.inner.lock().unwrap().max_lun_response = Some(value);
    }

    /// Makes TEST UNIT READY report NOT READY for the first `n` polls.
    pub fn set_not_ready_for_polls(&self, n: u32) {
        self.inner.lock().unwrap().scsi.not_ready_until_nth_poll = n + 1;
    }

    /// Makes the next `n` commands fail with CSW status 2 (phase error)
    /// before processing resumes normally.
    pub fn set_phase_error_for_attempts(&self, n: u32) {
        self.inner.lock().unwrap().scsi.fail_with_phase_error_for_n_attempts = n;
    }

    /// Makes READ CAPACITY(10) report the `0xFFFF_FFFF` sentinel, forcing
    /// callers to promote to READ CAPACITY(16).
    pub fn set_capacity_sentinel(&self, value: bool) {
        self.inner.lock().unwrap().scsi.capacity_sentinel = value;
    }

    pub fn push_hotplug(&self, signal: HotplugSignal) {
        self.inner.lock().unwrap().hotplug.push_back(signal);
    }

    /// Simulates the device vanishing: no longer available, no longer
    /// acquired. Used to exercise the manager's hotplug-prune path.
    pub fn disconnect_interface(&self, id: InterfaceId) {
        let mut inner = self.inner.lock().unwrap();
        inner.available.retain(|h| h.id != id);
        inner.acquired.remove(&id);
    }
}

impl UsbHost for FakeUsbHost {
    fn enumerate_acquired(&self) -> Vec<InterfaceHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .available
            .iter()
            .filter(|h| inner.acquired.contains(&h.id))
            .cloned()
            .collect()
    }

    fn enumerate_available(&self, filter: &InterfaceFilter) -> Vec<InterfaceHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .available
            .iter()
            .filter(|h| !inner.acquired.contains(&h.id))
            .filter(|h| super::filter::matches_filter(&h.descriptor, filter))
            .cloned()
            .collect()
    }

    fn acquire_interface(&self, id: InterfaceId) -> Result<(), UsbError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.available.iter().any(|h| h.id == id) {
            inner.acquired.insert(id);
            Ok(())
        } else {
            Err(UsbError::InterfaceUnavailable)
        }
    }

    fn get_config(&self, _id: InterfaceId) -> Result<u8, UsbError> {
        Ok(0)
    }

    fn set_config(&self, _id: InterfaceId, _config: u8) -> Result<(), UsbError> {
        Ok(())
    }

    fn set_alt_setting(&self, _id: InterfaceId, _alt: u8) -> Result<(), UsbError> {
        Ok(())
    }

    fn open_endpoint(
        &self,
        _id: InterfaceId,
        ep: EndpointDescriptor,
    ) -> Result<EndpointHandle, UsbError> {
        let mut inner = self.inner.lock().unwrap();
        let handle = inner.next_handle;
        inner.next_handle += 1;
        inner.endpoints.insert(
            handle,
            EndpointState {
                descriptor: Some(ep),
            },
        );
        Ok(handle)
    }

    fn close_endpoint(&self, ep: EndpointHandle) {
        self.inner.lock().unwrap().endpoints.remove(&ep);
    }

    fn post(&self, ep: EndpointHandle, buf: &mut [u8], len: usize) -> Result<usize, UsbError> {
        let mut inner = self.inner.lock().unwrap();
        let direction = inner
            .endpoints
            .get(&ep)
            .and_then(|e| e.descriptor)
            .map(|d| d.direction)
            .unwrap_or(EndpointDirection::In);

        match direction {
            EndpointDirection::Out => {
                let data = &buf[..len];
                if len == 31 && u32::from_le_bytes([data[0], data[1], data[2], data[3]]) == CBW_SIGNATURE
                {
                    let response = inner.scsi.handle_cbw(data);
                    inner.in_queue.extend(response);
                } else if let Some(csw) = inner.scsi.accept_write_data(data) {
                    inner.in_queue.extend(csw);
                }
                Ok(len)
            }
            EndpointDirection::In => {
                let n = len.min(inner.in_queue.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = inner.in_queue.pop_front().unwrap();
                }
                if n == 0 {
                    Err(UsbError::ShortTransfer)
                } else {
                    Ok(n)
                }
            }
        }
    }

    fn get_endpoint_halted(&self, _id: InterfaceId, _ep: EndpointDescriptor) -> bool {
        false
    }

    fn clear_endpoint_halt(&self, _id: InterfaceId, _ep: EndpointDescriptor) {}

    fn control_transfer(
        &self,
        _id: InterfaceId,
        xfer: ControlTransfer,
        buf: Option<&mut [u8]>,
    ) -> Result<usize, UsbError> {
        if xfer.request == REQ_GET_MAX_LUN {
            let inner = self.inner.lock().unwrap();
            return match (inner.max_lun_response, buf) {
                (Some(v), Some(buf)) if !buf.is_empty() => {
                    buf[0] = v;
                    Ok(1)
                }
                (None, _) => Err(UsbError::Stalled),
                _ => Ok(0),
            };
        }
        Ok(0)
    }

    fn reset_device(&self, _id: InterfaceId) {}
    fn close_interface(&self, id: InterfaceId) {
        self.inner.lock().unwrap().acquired.remove(&id);
    }

    fn wait_hotplug(&self) -> HotplugSignal {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hotplug
            .pop_front()
            .unwrap_or(HotplugSignal::InterfaceAvailable)
    }

    fn clear_interface_state_change(&self) {}
}

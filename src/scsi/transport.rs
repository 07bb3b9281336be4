//! SCSI transport `Device` (C2, spec.md §4.2).
//!
//! Grounded on `original_source/fsp-usb/source/impl/fspusb_scsi.cpp`'s
//! `SCSIDevice::PushCommand` / `ReadStatus` / `TransferCommand` and the
//! teacher's `msc.rs` `MscDevice::scsi_command`/`wait_transfer`. The
//! command/status DMA buffers (`buf_a`/`buf_c`) are carried over from the
//! teacher's triple-buffer layout; the data phase transfers directly
//! through the caller's own buffer instead of a third bounce buffer, since
//! that copy belongs to whichever `UsbHost` implementation owns real DMA
//! memory on the other side of the trait boundary. Only the scheduler
//! substrate (std threads instead of a bare-metal event loop) and the
//! health flag (an explicit enum per §9's redesign note, instead of a bare
//! `ok: bool`) otherwise differ from the original.

use crate::config::Config;
use crate::error::ScsiError;
use crate::scsi::command::{CommandStatus, ScsiCommand};
use crate::usb::bulk::bulk_post;
use crate::usb::platform::{EndpointDescriptor, EndpointHandle, InterfaceId, UsbHost};
use crate::usb::DmaBuffer;
use std::sync::Arc;

/// Health of a SCSI context. Once `Faulted`, every operation short-circuits
/// (spec.md §9 "Drive marked not ok").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Faulted,
}

/// Owns the command/status DMA buffers and endpoint session for one LUN's
/// BOT session (spec.md §3 "SCSIDevice").
pub struct Device {
    host: Arc<dyn UsbHost>,
    interface_id: InterfaceId,
    in_ep: EndpointHandle,
    in_ep_desc: EndpointDescriptor,
    out_ep: EndpointHandle,
    out_ep_desc: EndpointDescriptor,
    lun: u8,
    buf_a: DmaBuffer, // command (CBW)
    buf_c: DmaBuffer, // status (CSW)
    health: Health,
}

impl Device {
    pub fn new(
        host: Arc<dyn UsbHost>,
        interface_id: InterfaceId,
        in_ep: EndpointHandle,
        in_ep_desc: EndpointDescriptor,
        out_ep: EndpointHandle,
        out_ep_desc: EndpointDescriptor,
        lun: u8,
    ) -> Option<Self> {
        Some(Self {
            host,
            interface_id,
            in_ep,
            in_ep_desc,
            out_ep,
            out_ep_desc,
            lun,
            buf_a: DmaBuffer::alloc(1)?,
            buf_c: DmaBuffer::alloc(1)?,
            health: Health::Healthy,
        })
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn lun(&self) -> u8 {
        self.lun
    }

    /// Writes the CBW for `cmd` into `buf_a` and posts it to the OUT
    /// endpoint. `diff` subtracts from the declared data-transfer length iff
    /// `0 < diff < data_len` (§4.2 "push_command").
    fn push_command(&mut self, cmd: ScsiCommand, block_size: u32, diff: u32, cfg: &Config) -> bool {
        let mut cbw = [0u8; 31];
        cmd.encode_into(&mut cbw, self.lun, block_size, diff);
        self.buf_a.as_mut_slice()[..31].copy_from_slice(&cbw);

        match bulk_post(
            self.host.as_ref(),
            self.interface_id,
            self.out_ep,
            self.out_ep_desc,
            &mut self.buf_a.as_mut_slice()[..31],
            31,
            cfg,
        ) {
            Ok(_) => true,
            Err(_) => {
                if self.host.as_ref().get_endpoint_halted(self.interface_id, self.out_ep_desc) {
                    log::warn!("interface {}: OUT endpoint stalled on CBW, resetting", self.interface_id);
                    self.reset(cfg);
                }
                false
            }
        }
    }

    /// Reads the 13-byte CSW from the IN endpoint.
    fn read_status(&mut self, expect_tag: u32, cfg: &Config) -> Option<CommandStatus> {
        let n = match bulk_post(
            self.host.as_ref(),
            self.interface_id,
            self.in_ep,
            self.in_ep_desc,
            &mut self.buf_c.as_mut_slice()[..13],
            13,
            cfg,
        ) {
            Ok(n) => n,
            Err(_) => {
                log::warn!("interface {}: CSW read failed, resetting and faulting", self.interface_id);
                self.reset(cfg);
                self.health = Health::Faulted;
                return None;
            }
        };

        if n != 13 {
            log::warn!("interface {}: short CSW ({n} bytes), resetting and faulting", self.interface_id);
            self.reset(cfg);
            self.health = Health::Faulted;
            return None;
        }

        let csw = match CommandStatus::parse(&self.buf_c.as_slice()[..13]) {
            Some(csw) if csw.tag == expect_tag => csw,
            _ => {
                log::warn!("interface {}: CSW signature/tag mismatch, resetting and faulting", self.interface_id);
                self.reset(cfg);
                self.health = Health::Faulted;
                return None;
            }
        };

        if csw.phase_error() {
            log::debug!("interface {}: CSW phase error, resetting for retry", self.interface_id);
            self.reset(cfg);
        }

        Some(csw)
    }

    fn reset(&mut self, cfg: &Config) {
        log::debug!("interface {}: performing bulk-only reset", self.interface_id);
        crate::usb::bulk::bulk_only_reset(
            self.host.as_ref(),
            self.interface_id,
            self.in_ep_desc,
            self.out_ep_desc,
            cfg,
        );
    }

    /// Top-level operation: runs `cmd`'s full command/data/status cycle,
    /// retrying up to `Config::scsi_transfer_retries` times (spec.md §4.2
    /// "transfer_command").
    pub fn transfer_command(
        &mut self,
        cmd: ScsiCommand,
        buffer: &mut [u8],
        block_size: u32,
        cfg: &Config,
    ) -> Result<CommandStatus, ScsiError> {
        if self.health == Health::Faulted {
            return Err(ScsiError::TransportFaulted);
        }

        let data_len = cmd.data_len(block_size) as usize;
        let direction = cmd.direction();

        for attempt in 0..cfg.scsi_transfer_retries {
            self.health = Health::Healthy;
            let mut total_transferred: u32 = 0;

            if !self.push_command(cmd, block_size, total_transferred, cfg) {
                log::debug!("interface {}: CBW push failed on attempt {attempt}, retrying", self.interface_id);
                continue;
            }

            if data_len > 0 {
                let mut early_csw = None;
                let mut chunk_failed = false;

                while (total_transferred as usize) < data_len {
                    let remaining = data_len - total_transferred as usize;
                    let chunk_len = remaining.min(cfg.max_chunk_len);
                    let chunk = &mut buffer[total_transferred as usize..total_transferred as usize + chunk_len];

                    let (ep, ep_desc) = match direction {
                        crate::scsi::command::Direction::In => (self.in_ep, self.in_ep_desc),
                        _ => (self.out_ep, self.out_ep_desc),
                    };

                    match bulk_post(self.host.as_ref(), self.interface_id, ep, ep_desc, chunk, chunk_len, cfg) {
                        Ok(n) => {
                            // A short IN chunk that parses as a valid CSW is treated
                            // as an "early CSW" (§4.2 step 3, short-data-immediate-
                            // status devices).
                            if direction == crate::scsi::command::Direction::In && n == 13 {
                                if let Some(csw) = CommandStatus::parse(&chunk[..13]) {
                                    if csw.tag == crate::scsi::command::CBW_TAG {
                                        early_csw = Some(csw);
                                        break;
                                    }
                                }
                            }
                            total_transferred += n as u32;
                            if n < chunk_len {
                                chunk_failed = true;
                                break;
                            }
                        }
                        Err(_) => {
                            chunk_failed = true;
                            break;
                        }
                    }
                }

                if let Some(csw) = early_csw {
                    return Ok(csw);
                }
                if chunk_failed {
                    log::debug!("interface {}: data phase failed on attempt {attempt}, retrying", self.interface_id);
                    continue;
                }
            }

            if let Some(csw) = self.read_status(crate::scsi::command::CBW_TAG, cfg) {
                if csw.passed() || !csw.phase_error() {
                    return Ok(csw);
                }
                // phase error: reset already issued by read_status; retry.
                continue;
            }
        }

        log::error!(
            "interface {}: SCSI transfer exhausted {} retries, faulting transport",
            self.interface_id,
            cfg.scsi_transfer_retries
        );
        self.health = Health::Faulted;
        Err(ScsiError::TransportFaulted)
    }
}

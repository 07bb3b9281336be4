//! USB control/bulk helpers (C1, spec.md §4.1).
//!
//! Grounded on `original_source/fsp-usb/source/impl/fspusb_request.cpp`
//! (`GetMaxLUN`, `ResetBulkStorage`, `ClearEndpointHalt`,
//! `GetEndpointStatus`) and the teacher's `ram::Dma` allocation contract.

use crate::config::Config;
use crate::error::UsbError;
use crate::usb::platform::{
    ControlTransfer, EndpointDescriptor, InterfaceId, Recipient, RequestKind, UsbHost,
};
use crate::usb::EndpointDirection;
use std::thread::sleep;

const REQ_GET_MAX_LUN: u8 = 0xFE;
const REQ_BULK_ONLY_RESET: u8 = 0xFF;
const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_GET_STATUS: u8 = 0x00;
const FEATURE_ENDPOINT_HALT: u16 = 0x00;

/// Highest plausible max-LUN value (§4.1: "or implausible (>15)").
const MAX_PLAUSIBLE_LUN: u8 = 15;

/// Queries the device's maximum LUN. Falls back to a single LUN when the
/// request stalls (common on single-LUN devices) or returns an implausible
/// value.
pub fn get_max_lun(host: &dyn UsbHost, id: InterfaceId, cfg: &Config) -> u8 {
    let mut buf = [0u8; 1];
    let xfer = ControlTransfer {
        direction: EndpointDirection::In,
        kind: RequestKind::Class,
        recipient: Recipient::Interface,
        request: REQ_GET_MAX_LUN,
        value: 0,
        index: 0,
    };
    let result = host.control_transfer(id, xfer, Some(&mut buf));
    sleep(cfg.control_settle_delay());

    match result {
        Ok(1) if buf[0] <= MAX_PLAUSIBLE_LUN => {
            log::debug!("interface {id}: max LUN reported as {}", buf[0]);
            buf[0] + 1
        }
        Ok(_) => {
            log::warn!("interface {id}: implausible max-LUN response, assuming 1 LUN");
            1
        }
        Err(_) => {
            log::debug!("interface {id}: Get Max LUN stalled, assuming 1 LUN");
            1
        }
    }
}

/// Performs a Bulk-Only Mass Storage Reset followed by a Clear-Feature(HALT)
/// on both bulk endpoints.
pub fn bulk_only_reset(
    host: &dyn UsbHost,
    id: InterfaceId,
    in_ep: EndpointDescriptor,
    out_ep: EndpointDescriptor,
    cfg: &Config,
) {
    log::debug!("interface {id}: performing bulk-only mass storage reset");
    let xfer = ControlTransfer {
        direction: EndpointDirection::Out,
        kind: RequestKind::Class,
        recipient: Recipient::Interface,
        request: REQ_BULK_ONLY_RESET,
        value: 0,
        index: 0,
    };
    let _ = host.control_transfer(id, xfer, None);
    sleep(cfg.control_settle_delay());

    clear_endpoint_halt(host, id, in_ep, cfg);
    clear_endpoint_halt(host, id, out_ep, cfg);
}

/// Returns whether `ep` is currently halted (GET_STATUS, standard/endpoint).
pub fn get_endpoint_halted(
    host: &dyn UsbHost,
    id: InterfaceId,
    ep: EndpointDescriptor,
    cfg: &Config,
) -> bool {
    let mut buf = [0u8; 2];
    let xfer = ControlTransfer {
        direction: EndpointDirection::In,
        kind: RequestKind::Standard,
        recipient: Recipient::Endpoint,
        request: REQ_GET_STATUS,
        value: 0,
        index: endpoint_index(ep),
    };
    let result = host.control_transfer(id, xfer, Some(&mut buf));
    sleep(cfg.control_settle_delay());
    matches!(result, Ok(2)) && (buf[0] & 0x01) != 0
}

/// Clears a halted endpoint (Clear-Feature(ENDPOINT_HALT)).
pub fn clear_endpoint_halt(
    host: &dyn UsbHost,
    id: InterfaceId,
    ep: EndpointDescriptor,
    cfg: &Config,
) {
    let xfer = ControlTransfer {
        direction: EndpointDirection::Out,
        kind: RequestKind::Standard,
        recipient: Recipient::Endpoint,
        request: REQ_CLEAR_FEATURE,
        value: FEATURE_ENDPOINT_HALT,
        index: endpoint_index(ep),
    };
    let _ = host.control_transfer(id, xfer, None);
    sleep(cfg.control_settle_delay());
}

fn endpoint_index(ep: EndpointDescriptor) -> u16 {
    let dir_bit = match ep.direction {
        EndpointDirection::In => 0x80,
        EndpointDirection::Out => 0x00,
    };
    (ep.address as u16) | dir_bit
}

/// Posts `buf[..len]` to `ep`. On failure, checks whether the endpoint
/// stalled and clears the halt if so (§4.1 "bulk_post").
pub fn bulk_post(
    host: &dyn UsbHost,
    id: InterfaceId,
    ep_handle: u32,
    ep_desc: EndpointDescriptor,
    buf: &mut [u8],
    len: usize,
    cfg: &Config,
) -> Result<usize, UsbError> {
    match host.post(ep_handle, buf, len) {
        Ok(n) => Ok(n),
        Err(e) => {
            if host.get_endpoint_halted(id, ep_desc) {
                log::warn!("interface {id}: endpoint stalled, clearing halt");
                clear_endpoint_halt(host, id, ep_desc, cfg);
            }
            Err(e)
        }
    }
}

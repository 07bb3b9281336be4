//! The platform USB-host boundary.
//!
//! spec.md §6 lists this surface ("Platform USB host (required operations
//! consumed)") as an external collaborator this crate does not implement —
//! in the teacher that role was played by `XhciCtrl`/`reg.rs`, a concrete
//! xHCI register-level driver. Here it is a trait so the rest of the crate
//! never depends on a specific host-controller implementation; a real
//! integration provides a `UsbHost` that talks to the platform's USB stack,
//! and `FakeUsbHost` (test-only) provides one that simulates a BBB/SCSI
//! device in-process for the §8 scenarios.

use super::filter::{InterfaceDescriptor, InterfaceFilter};

/// Stable small integer identifying a USB interface, assigned by the
/// platform (§3 "Drive.interface_id").
pub type InterfaceId = i32;

/// Opaque handle to an open endpoint, returned by [`UsbHost::open_endpoint`].
pub type EndpointHandle = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: EndpointDirection,
    pub max_packet_size: u16,
}

/// An interface the platform reports as available (matching the installed
/// filter) or already acquired.
#[derive(Debug, Clone)]
pub struct InterfaceHandle {
    pub id: InterfaceId,
    pub descriptor: InterfaceDescriptor,
    /// Endpoint descriptors in the order the configuration descriptor lists
    /// them (§4.6 "locate the first input/output-endpoint-descriptor").
    pub endpoints: Vec<EndpointDescriptor>,
    pub current_config: u8,
    pub desired_config: u8,
}

/// The recipient field of a USB control transfer's bmRequestType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
}

/// The type field of a USB control transfer's bmRequestType.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Standard,
    Class,
}

/// A fully-specified control transfer (§4.1: Get Max LUN, Bulk-Only Reset,
/// Get/Clear-Feature endpoint halt).
#[derive(Debug, Clone, Copy)]
pub struct ControlTransfer {
    pub direction: EndpointDirection,
    pub kind: RequestKind,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// Which of the manager's two platform-driven wait conditions fired (§4.6
/// "Update loop").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugSignal {
    /// Interface state changed (manual-clear; caller must call
    /// [`UsbHost::clear_interface_state_change`] after observing it).
    InterfaceStateChange,
    /// A new interface matching the installed filter became available
    /// (auto-clear; the platform clears it on wake).
    InterfaceAvailable,
}

/// The USB host operations spec.md §6 requires of the platform.
pub trait UsbHost: Send + Sync {
    /// Interfaces currently acquired by this process (used by the prune
    /// phase of `update_drives`, §4.6).
    fn enumerate_acquired(&self) -> Vec<InterfaceHandle>;

    /// Interfaces available and matching `filter`, not yet acquired.
    fn enumerate_available(&self, filter: &InterfaceFilter) -> Vec<InterfaceHandle>;

    /// Acquires exclusive access to an interface reported by
    /// [`UsbHost::enumerate_available`].
    fn acquire_interface(&self, id: InterfaceId) -> core::result::Result<(), crate::error::UsbError>;

    fn get_config(&self, id: InterfaceId) -> core::result::Result<u8, crate::error::UsbError>;
    fn set_config(&self, id: InterfaceId, config: u8) -> core::result::Result<(), crate::error::UsbError>;
    fn set_alt_setting(&self, id: InterfaceId, alt: u8) -> core::result::Result<(), crate::error::UsbError>;

    fn open_endpoint(
        &self,
        id: InterfaceId,
        ep: EndpointDescriptor,
    ) -> core::result::Result<EndpointHandle, crate::error::UsbError>;
    fn close_endpoint(&self, ep: EndpointHandle);

    /// Posts `buf[..len]` to `ep`, returning the number of bytes actually
    /// transferred (may be fewer than `len` on a short transfer).
    fn post(&self, ep: EndpointHandle, buf: &mut [u8], len: usize) -> core::result::Result<usize, crate::error::UsbError>;

    fn get_endpoint_halted(&self, id: InterfaceId, ep: EndpointDescriptor) -> bool;
    fn clear_endpoint_halt(&self, id: InterfaceId, ep: EndpointDescriptor);

    fn control_transfer(
        &self,
        id: InterfaceId,
        xfer: ControlTransfer,
        buf: Option<&mut [u8]>,
    ) -> core::result::Result<usize, crate::error::UsbError>;

    fn reset_device(&self, id: InterfaceId);
    fn close_interface(&self, id: InterfaceId);

    /// Blocks until a hotplug-relevant condition fires. `None` means the
    /// manager's own exit signal should take over (used by test doubles that
    /// have nothing left to report).
    fn wait_hotplug(&self) -> HotplugSignal;
    fn clear_interface_state_change(&self);
}

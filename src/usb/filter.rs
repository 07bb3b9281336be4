//! Mass-storage interface matching (§3 "UsbInterface filter").
//!
//! Grounded on the teacher's `desc::class` / `desc::msc_protocol` constant
//! modules, narrowed to the three values the Bulk-Only Transport filter
//! actually tests.

/// Interface class code for USB Mass Storage.
pub const CLASS_MASS_STORAGE: u8 = 0x08;
/// Subclass code for the SCSI transparent command set.
pub const SUBCLASS_SCSI_TRANSPARENT: u8 = 0x06;
/// Protocol code for Bulk-Only Transport.
pub const PROTOCOL_BULK_ONLY: u8 = 0x50;

/// A USB interface descriptor, as enumerated by the platform USB host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
}

/// Filter criteria for interface enumeration. Only the three BOT/SCSI fields
/// are ever set by this crate (§3), but the type mirrors the platform's
/// general-purpose filter so other class/subclass/protocol triples remain
/// expressible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// The filter this crate installs with the platform hotplug layer (§4.6
/// `initialize`).
pub const fn mass_storage_filter() -> InterfaceFilter {
    InterfaceFilter {
        class: CLASS_MASS_STORAGE,
        subclass: SUBCLASS_SCSI_TRANSPARENT,
        protocol: PROTOCOL_BULK_ONLY,
    }
}

/// Returns true if `iface` matches `filter` on class, subclass and protocol.
pub fn matches_filter(iface: &InterfaceDescriptor, filter: &InterfaceFilter) -> bool {
    iface.interface_class == filter.class
        && iface.interface_subclass == filter.subclass
        && iface.interface_protocol == filter.protocol
}

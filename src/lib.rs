//! Mounts USB Bulk-Only Transport / SCSI transparent mass-storage devices as
//! FAT-family filesystems for a host filesystem service.
//!
//! A background thread watches for USB mass-storage interfaces matching the
//! Bulk-Only/SCSI filter, negotiates a SCSI session and capacity over each
//! newly attached interface, and mounts a FAT volume over the resulting
//! block device. Foreground callers go through [`service`] to list mounted
//! drives and perform file/directory operations against them.
//!
//! # Layering
//!
//! - [`usb`] — control/bulk transport helpers (C1) and the [`usb::UsbHost`]
//!   platform boundary this crate consumes rather than implements.
//! - [`scsi`] — command encoding (C3), the Bulk-Only transport state machine
//!   (C2), and capacity/read/write negotiation (C4).
//! - [`drive`] — one mounted volume's lifecycle (C5).
//! - [`manager`] — hotplug detection and mount-slot arbitration across all
//!   drives (C6).
//! - [`fat`] — the FAT adapter translating filesystem requests into calls
//!   against the `fatfs` crate (C7).
//! - [`service`] — the RPC-shaped public surface (C8).

pub mod config;
pub mod drive;
pub mod error;
pub mod fat;
pub mod manager;
pub mod scsi;
pub mod service;
pub mod usb;

pub use error::{Error, Result};
pub use manager::Manager;

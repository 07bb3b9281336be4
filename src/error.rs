//! Crate-wide error taxonomy.
//!
//! Mirrors the recovery policy described by the transport and block layers:
//! most errors propagate to the RPC caller unchanged, a handful are recovered
//! locally (stalls, phase errors, early CSWs) and never surface here at all.

use core::fmt;

/// Errors raised by the USB Bulk-Only transport layer (C1/C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// The platform host API reported a transfer failure.
    TransferFailed,
    /// A control or bulk transfer returned fewer bytes than requested.
    ShortTransfer,
    /// The endpoint is halted and recovery did not clear it.
    Stalled,
    /// The interface could not be acquired or configured.
    InterfaceUnavailable,
    /// DMA buffer allocation failed.
    OutOfMemory,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsbError::TransferFailed => write!(f, "USB transfer failed"),
            UsbError::ShortTransfer => write!(f, "USB transfer returned fewer bytes than requested"),
            UsbError::Stalled => write!(f, "endpoint stalled and could not be cleared"),
            UsbError::InterfaceUnavailable => write!(f, "USB interface unavailable"),
            UsbError::OutOfMemory => write!(f, "DMA buffer allocation failed"),
        }
    }
}

impl std::error::Error for UsbError {}

/// Errors raised by the SCSI block layer (C4), keyed by sense key when one
/// was returned by REQUEST SENSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiError {
    /// TEST UNIT READY / REQUEST SENSE handshake could not bring the unit
    /// ready (an unrecoverable sense key, per §4.4).
    NotReady(u8),
    /// READ CAPACITY returned a zero capacity or block size.
    BadCapacity,
    /// The underlying transport is faulted.
    TransportFaulted,
}

impl fmt::Display for ScsiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScsiError::NotReady(key) => write!(f, "unit not ready (sense key 0x{key:02x})"),
            ScsiError::BadCapacity => write!(f, "device reported zero capacity or block size"),
            ScsiError::TransportFaulted => write!(f, "SCSI transport is faulted"),
        }
    }
}

impl std::error::Error for ScsiError {}

/// FAT library error kinds mapped per §7's canonical table. Kinds without an
/// explicit mapping surface as `Other(code)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatErrorKind {
    /// FR_NO_FILE / FR_NO_PATH / FR_INVALID_NAME.
    PathNotFound,
    /// FR_EXIST.
    PathAlreadyExists,
    /// FR_WRITE_PROTECTED.
    UnsupportedOperation,
    /// FR_INVALID_DRIVE.
    InvalidMountName,
    /// FR_INVALID_PARAMETER.
    InvalidArgument,
    /// Any other std::io error surfaced by the `fatfs` crate, tagged with
    /// the underlying `std::io::ErrorKind` for diagnostics.
    Other(std::io::ErrorKind),
}

impl fmt::Display for FatErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatErrorKind::PathNotFound => write!(f, "path not found"),
            FatErrorKind::PathAlreadyExists => write!(f, "path already exists"),
            FatErrorKind::UnsupportedOperation => write!(f, "unsupported operation (write protected)"),
            FatErrorKind::InvalidMountName => write!(f, "invalid mount name"),
            FatErrorKind::InvalidArgument => write!(f, "invalid argument"),
            FatErrorKind::Other(kind) => write!(f, "FAT error ({kind:?})"),
        }
    }
}

impl From<std::io::Error> for FatErrorKind {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound | InvalidFilename => FatErrorKind::PathNotFound,
            AlreadyExists => FatErrorKind::PathAlreadyExists,
            PermissionDenied => FatErrorKind::UnsupportedOperation,
            InvalidInput => FatErrorKind::InvalidArgument,
            other => FatErrorKind::Other(other),
        }
    }
}

/// Top-level error type returned to RPC callers (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller's interface-id is not currently mounted.
    InvalidDriveInterfaceId,
    /// Drive was mounted but has been disconnected before the request
    /// completed.
    DriveUnavailable,
    /// SCSI handshake failed; drive is not usable.
    DriveInitializationFailure,
    /// FAT library error, mapped per the §7 table.
    Fat(FatErrorKind),
    /// Operation deliberately unimplemented (range operations, query entry).
    NotImplemented,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidDriveInterfaceId => write!(f, "invalid drive interface id"),
            Error::DriveUnavailable => write!(f, "drive unavailable"),
            Error::DriveInitializationFailure => write!(f, "drive initialization failure"),
            Error::Fat(kind) => write!(f, "{kind}"),
            Error::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Fat(FatErrorKind::from(err))
    }
}

impl From<UsbError> for Error {
    fn from(_: UsbError) -> Self {
        Error::DriveInitializationFailure
    }
}

impl From<ScsiError> for Error {
    fn from(_: ScsiError) -> Self {
        Error::DriveInitializationFailure
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

//! USB transport building blocks (C1) and the platform boundary they run on.

pub mod bulk;
pub mod dma;
pub mod filter;
pub mod platform;
#[cfg(test)]
pub mod test_support;

pub use dma::DmaBuffer;
pub use filter::{mass_storage_filter, matches_filter, InterfaceDescriptor, InterfaceFilter};
pub use platform::{
    ControlTransfer, EndpointDescriptor, EndpointDirection, InterfaceHandle, UsbHost,
};

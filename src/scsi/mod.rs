//! SCSI command builders (C3), transport (C2) and block layer (C4).

pub mod block;
pub mod command;
pub mod transport;

pub use block::Block;
pub use command::ScsiCommand;
pub use transport::{Device, Health};

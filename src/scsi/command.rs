//! SCSI command builders (C3, spec.md §4.3).
//!
//! Tagged-variant redesign of the teacher's per-opcode CDB builders in
//! `msc.rs` (§9 "virtual inheritance of command objects → tagged variant").
//! Each variant knows its own opcode, CB length, data direction and reply
//! length; `encode_into` produces the 31-byte CBW image.

/// Fixed CBW tag this crate stamps on every command (spec.md §3).
pub const CBW_TAG: u32 = 0xDEAD_BEEF;
/// CBW signature ("USBC").
pub const CBW_SIGNATURE: u32 = 0x4342_5355;
/// CSW signature ("USBS").
pub const CSW_SIGNATURE: u32 = 0x5342_5355;

/// Direction of a command's data phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    None,
    In,
    Out,
}

/// One SCSI command, tagged by kind (spec.md §3 "SCSICommand").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiCommand {
    Inquiry { alloc_len: u8 },
    TestUnitReady,
    RequestSense { alloc_len: u8 },
    ReadCapacity10,
    ReadCapacity16 { alloc_len: u32 },
    Read10 { lba: u32, blocks: u16 },
    Read16 { lba: u64, blocks: u32 },
    Write10 { lba: u32, blocks: u16 },
    Write16 { lba: u64, blocks: u32 },
}

impl ScsiCommand {
    /// Data-phase direction, per the §4.3 table.
    pub fn direction(&self) -> Direction {
        match self {
            ScsiCommand::TestUnitReady => Direction::None,
            ScsiCommand::Inquiry { .. }
            | ScsiCommand::RequestSense { .. }
            | ScsiCommand::ReadCapacity10
            | ScsiCommand::ReadCapacity16 { .. }
            | ScsiCommand::Read10 { .. }
            | ScsiCommand::Read16 { .. } => Direction::In,
            ScsiCommand::Write10 { .. } | ScsiCommand::Write16 { .. } => Direction::Out,
        }
    }

    /// Number of data bytes this command's data phase transfers, given
    /// `block_size` for the Read/Write variants.
    pub fn data_len(&self, block_size: u32) -> u32 {
        match self {
            ScsiCommand::TestUnitReady => 0,
            ScsiCommand::Inquiry { alloc_len } | ScsiCommand::RequestSense { alloc_len } => *alloc_len as u32,
            ScsiCommand::ReadCapacity10 => 8,
            ScsiCommand::ReadCapacity16 { alloc_len } => *alloc_len,
            ScsiCommand::Read10 { blocks, .. } | ScsiCommand::Write10 { blocks, .. } => {
                *blocks as u32 * block_size
            }
            ScsiCommand::Read16 { blocks, .. } | ScsiCommand::Write16 { blocks, .. } => {
                *blocks * block_size
            }
        }
    }

    fn cb_len(&self) -> u8 {
        match self {
            ScsiCommand::TestUnitReady | ScsiCommand::Inquiry { .. } | ScsiCommand::RequestSense { .. } => 6,
            ScsiCommand::ReadCapacity10 => 10,
            ScsiCommand::ReadCapacity16 { .. }
            | ScsiCommand::Read16 { .. }
            | ScsiCommand::Write16 { .. } => 16,
            ScsiCommand::Read10 { .. } | ScsiCommand::Write10 { .. } => 10,
        }
    }

    fn write_cdb(&self, cdb: &mut [u8]) {
        match *self {
            ScsiCommand::TestUnitReady => {
                cdb[0] = 0x00;
            }
            ScsiCommand::Inquiry { alloc_len } => {
                cdb[0] = 0x12;
                cdb[4] = alloc_len;
            }
            ScsiCommand::RequestSense { alloc_len } => {
                cdb[0] = 0x03;
                cdb[4] = alloc_len;
            }
            ScsiCommand::ReadCapacity10 => {
                cdb[0] = 0x25;
            }
            ScsiCommand::ReadCapacity16 { alloc_len } => {
                cdb[0] = 0x9E;
                cdb[1] = 0x10; // service action
                cdb[10..14].copy_from_slice(&alloc_len.to_be_bytes());
            }
            ScsiCommand::Read10 { lba, blocks } => {
                cdb[0] = 0x28;
                cdb[2..6].copy_from_slice(&lba.to_be_bytes());
                cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
            }
            ScsiCommand::Write10 { lba, blocks } => {
                cdb[0] = 0x2A;
                cdb[2..6].copy_from_slice(&lba.to_be_bytes());
                cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
            }
            ScsiCommand::Read16 { lba, blocks } => {
                cdb[0] = 0x88;
                cdb[2..10].copy_from_slice(&lba.to_be_bytes());
                cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
            }
            ScsiCommand::Write16 { lba, blocks } => {
                cdb[0] = 0x8A;
                cdb[2..10].copy_from_slice(&lba.to_be_bytes());
                cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
            }
        }
    }

    /// Serializes this command into a 31-byte CBW image, subtracting `diff`
    /// bytes from the data-transfer length (§4.2 `push_command`'s `diff`
    /// parameter, used to resume a retried partial data phase).
    pub fn encode_into(&self, buf: &mut [u8; 31], lun: u8, block_size: u32, diff: u32) {
        buf.fill(0);
        let data_len = self.data_len(block_size);
        let xfer_len = if diff > 0 && diff < data_len {
            data_len - diff
        } else {
            data_len
        };

        buf[0..4].copy_from_slice(&CBW_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&CBW_TAG.to_le_bytes());
        buf[8..12].copy_from_slice(&xfer_len.to_le_bytes());
        buf[12] = match self.direction() {
            Direction::In => 0x80,
            Direction::Out | Direction::None => 0x00,
        };
        buf[13] = lun;
        buf[14] = self.cb_len();
        self.write_cdb(&mut buf[15..31]);
    }
}

/// A parsed Command Status Wrapper (spec.md §3 "SCSICommandStatus").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStatus {
    pub tag: u32,
    pub data_residue: u32,
    pub status: u8,
}

impl CommandStatus {
    /// Parses a 13-byte CSW, validating the signature. Does not validate the
    /// tag; callers compare it against the tag they sent.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != 13 {
            return None;
        }
        let signature = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if signature != CSW_SIGNATURE {
            return None;
        }
        Some(Self {
            tag: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            data_residue: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            status: buf[12],
        })
    }

    pub fn passed(&self) -> bool {
        self.status == 0
    }

    pub fn phase_error(&self) -> bool {
        self.status == 2
    }
}

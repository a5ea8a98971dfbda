//! All covstream protocol block types.
//!
//! A covstream stream is a sequence of blocks.  Every block starts with a
//! single type byte followed by a type-specific payload; there is no length
//! prefix, so each payload layout is fully determined by its type.

use serde::{Deserialize, Serialize};

use crate::domain::execution::{ExecutionRecord, SessionInfo};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Magic number carried by every [`Block::Header`].
pub const MAGIC_NUMBER: u16 = 0xC0C0;

/// Stream format version carried by every [`Block::Header`].
pub const FORMAT_VERSION: u16 = 0x1007;

/// Encoded size of a header block: type byte + magic + version.
pub const HEADER_BLOCK_SIZE: usize = 5;

// ── Block type codes ──────────────────────────────────────────────────────────

/// All block type codes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    /// Stream header; must be the first block sent in each direction.
    Header = 0x01,
    /// Describes the collection session the following records belong to.
    SessionInfo = 0x10,
    /// Probe data for one class.
    ExecutionData = 0x11,
    /// Acknowledges a completed command.
    CmdOk = 0x20,
    /// Asks the remote side to dump and/or reset its execution data.
    CmdDump = 0x40,
}

impl TryFrom<u8> for BlockType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, ()> {
        match value {
            0x01 => Ok(BlockType::Header),
            0x10 => Ok(BlockType::SessionInfo),
            0x11 => Ok(BlockType::ExecutionData),
            0x20 => Ok(BlockType::CmdOk),
            0x40 => Ok(BlockType::CmdDump),
            _ => Err(()),
        }
    }
}

// ── Top-level block enum ──────────────────────────────────────────────────────

/// A decoded protocol block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Block {
    /// Stream header.  Magic and version are validated on decode, so a
    /// decoded header is always compatible.
    Header,
    SessionInfo(SessionInfo),
    ExecutionData(ExecutionRecord),
    CmdOk,
    /// Remote command: `dump` requests a snapshot, `reset` clears the
    /// accumulated data after the snapshot was taken.
    CmdDump { dump: bool, reset: bool },
}

impl Block {
    /// Returns the [`BlockType`] code for this block.
    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Header => BlockType::Header,
            Block::SessionInfo(_) => BlockType::SessionInfo,
            Block::ExecutionData(_) => BlockType::ExecutionData,
            Block::CmdOk => BlockType::CmdOk,
            Block::CmdDump { .. } => BlockType::CmdDump,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_type_try_from_known_codes() {
        assert_eq!(BlockType::try_from(0x01), Ok(BlockType::Header));
        assert_eq!(BlockType::try_from(0x10), Ok(BlockType::SessionInfo));
        assert_eq!(BlockType::try_from(0x11), Ok(BlockType::ExecutionData));
        assert_eq!(BlockType::try_from(0x20), Ok(BlockType::CmdOk));
        assert_eq!(BlockType::try_from(0x40), Ok(BlockType::CmdDump));
    }

    #[test]
    fn test_block_type_try_from_unknown_code_fails() {
        assert_eq!(BlockType::try_from(0x00), Err(()));
        assert_eq!(BlockType::try_from(0xFF), Err(()));
    }

    #[test]
    fn test_block_type_matches_variant() {
        let block = Block::CmdDump {
            dump: true,
            reset: false,
        };
        assert_eq!(block.block_type(), BlockType::CmdDump);
        assert_eq!(Block::Header.block_type() as u8, 0x01);
    }
}

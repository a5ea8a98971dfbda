//! Binary codec for encoding and decoding covstream protocol blocks.
//!
//! Wire format of each block:
//! ```text
//! [block_type:1][payload:N]
//! ```
//! Payload layouts:
//! ```text
//! Header         [magic:2][version:2]
//! SessionInfo    [id:str][start_ms:8][dump_ms:8]
//! ExecutionData  [class_id:8][name:str][probes:bool[]]
//! CmdOk          (empty)
//! CmdDump        [dump:1][reset:1]
//! ```
//! `str` is a 2-byte length followed by UTF-8 bytes.  `bool[]` is a varint
//! element count followed by the values packed eight per byte, least
//! significant bit first.  All fixed-width integers are big-endian.
//!
//! Blocks carry no length prefix, so a decoder that runs out of bytes in the
//! middle of a payload reports [`ProtocolError::InsufficientData`] and the
//! caller retries once more bytes have arrived.

use thiserror::Error;

use crate::domain::execution::{ExecutionRecord, SessionInfo};
use crate::protocol::blocks::{Block, BlockType, FORMAT_VERSION, MAGIC_NUMBER};

/// Errors that can occur during block decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice ends before the block is complete.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The block type byte is not a recognized value.
    #[error("unknown block type: 0x{0:02X}")]
    UnknownBlockType(u8),

    /// A header block carried the wrong magic number.
    #[error("invalid magic number: 0x{0:04X}")]
    InvalidMagic(u16),

    /// A header block carried an unsupported format version.
    #[error("unsupported format version: 0x{0:04X}")]
    UnsupportedVersion(u16),

    /// The payload could not be parsed (bad boolean, UTF-8 error, etc.).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Appends the encoding of `block` to `buf`.
///
/// # Examples
///
/// ```rust
/// use covstream_core::protocol::{decode_block, encode_block, Block};
///
/// let mut bytes = Vec::new();
/// encode_block(&Block::CmdDump { dump: true, reset: false }, &mut bytes);
/// let (decoded, consumed) = decode_block(&bytes).unwrap();
/// assert_eq!(decoded, Block::CmdDump { dump: true, reset: false });
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_block(block: &Block, buf: &mut Vec<u8>) {
    buf.push(block.block_type() as u8);
    match block {
        Block::Header => {
            buf.extend_from_slice(&MAGIC_NUMBER.to_be_bytes());
            buf.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        }
        Block::SessionInfo(info) => encode_session_info(buf, info),
        Block::ExecutionData(record) => encode_execution_data(buf, record),
        Block::CmdOk => {}
        Block::CmdDump { dump, reset } => {
            buf.push(u8::from(*dump));
            buf.push(u8::from(*reset));
        }
    }
}

/// Encodes a sequence of blocks into one contiguous buffer.
///
/// Used wherever several blocks must reach the socket in a single write.
pub fn encode_blocks<'a, I>(blocks: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a Block>,
{
    let mut buf = Vec::new();
    for block in blocks {
        encode_block(block, &mut buf);
    }
    buf
}

/// Decodes one [`Block`] from the beginning of `bytes`.
///
/// Returns the decoded block and the number of bytes consumed, so the caller
/// can advance their read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] when `bytes` holds only the
/// start of a block, and the other variants when the bytes are malformed.
pub fn decode_block(bytes: &[u8]) -> Result<(Block, usize), ProtocolError> {
    let mut cursor = Cursor::new(bytes);
    let type_byte = cursor.read_u8()?;
    let block_type =
        BlockType::try_from(type_byte).map_err(|_| ProtocolError::UnknownBlockType(type_byte))?;

    let block = match block_type {
        BlockType::Header => {
            let magic = cursor.read_u16()?;
            if magic != MAGIC_NUMBER {
                return Err(ProtocolError::InvalidMagic(magic));
            }
            let version = cursor.read_u16()?;
            if version != FORMAT_VERSION {
                return Err(ProtocolError::UnsupportedVersion(version));
            }
            Block::Header
        }
        BlockType::SessionInfo => {
            let id = cursor.read_string()?;
            let start_ms = cursor.read_i64()?;
            let dump_ms = cursor.read_i64()?;
            Block::SessionInfo(SessionInfo {
                id,
                start_ms,
                dump_ms,
            })
        }
        BlockType::ExecutionData => {
            let class_id = cursor.read_i64()?;
            let name = cursor.read_string()?;
            let probes = cursor.read_bool_array()?;
            Block::ExecutionData(ExecutionRecord {
                class_id,
                name,
                probes,
            })
        }
        BlockType::CmdOk => Block::CmdOk,
        BlockType::CmdDump => {
            let dump = cursor.read_bool()?;
            let reset = cursor.read_bool()?;
            Block::CmdDump { dump, reset }
        }
    };
    Ok((block, cursor.pos))
}

// ── Payload encoding ──────────────────────────────────────────────────────────

fn encode_session_info(buf: &mut Vec<u8>, info: &SessionInfo) {
    write_length_prefixed_string(buf, &info.id);
    buf.extend_from_slice(&info.start_ms.to_be_bytes());
    buf.extend_from_slice(&info.dump_ms.to_be_bytes());
}

fn encode_execution_data(buf: &mut Vec<u8>, record: &ExecutionRecord) {
    buf.extend_from_slice(&record.class_id.to_be_bytes());
    write_length_prefixed_string(buf, &record.name);
    write_bool_array(buf, &record.probes);
}

fn write_length_prefixed_string(buf: &mut Vec<u8>, s: &str) {
    // Truncate on a char boundary so the written bytes stay valid UTF-8.
    let mut len = s.len().min(u16::MAX as usize);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&s.as_bytes()[..len]);
}

fn write_var_int(buf: &mut Vec<u8>, mut value: u32) {
    while value & !0x7F != 0 {
        buf.push(0x80 | (value & 0x7F) as u8);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_bool_array(buf: &mut Vec<u8>, values: &[bool]) {
    write_var_int(buf, values.len() as u32);
    for chunk in values.chunks(8) {
        let mut byte = 0u8;
        for (bit, &value) in chunk.iter().enumerate() {
            if value {
                byte |= 1 << bit;
            }
        }
        buf.push(byte);
    }
}

// ── Payload decoding ──────────────────────────────────────────────────────────

/// Read cursor over a byte slice.
///
/// Every read that runs past the end returns `InsufficientData` with the
/// absolute number of bytes the block needs so far.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if self.buf.len() < end {
            return Err(ProtocolError::InsufficientData {
                needed: end,
                available: self.buf.len(),
            });
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            other => Err(ProtocolError::MalformedPayload(format!(
                "invalid boolean byte 0x{other:02X}"
            ))),
        }
    }

    fn read_u16(&mut self) -> Result<u16, ProtocolError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(i64::from_be_bytes(raw))
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|e| ProtocolError::MalformedPayload(format!("invalid UTF-8: {e}")))
    }

    fn read_var_int(&mut self) -> Result<u32, ProtocolError> {
        let mut value: u32 = 0;
        // A u32 needs at most five 7-bit groups.
        for shift in (0..35).step_by(7) {
            let byte = self.read_u8()?;
            value |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::MalformedPayload(
            "varint longer than 5 bytes".to_string(),
        ))
    }

    fn read_bool_array(&mut self) -> Result<Vec<bool>, ProtocolError> {
        let len = self.read_var_int()? as usize;
        let packed = self.take(len.div_ceil(8))?;
        Ok((0..len)
            .map(|i| packed[i / 8] & (1 << (i % 8)) != 0)
            .collect())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Streaming block reader.
//!
//! TCP is a *stream* protocol: a single `read()` call may return less than one
//! complete block, or several blocks at once.  [`BlockReader`] accumulates the
//! received bytes and hands out complete blocks one at a time, keeping any
//! trailing partial block until more bytes arrive.

use crate::protocol::blocks::Block;
use crate::protocol::codec::{decode_block, ProtocolError};

/// Accumulating decoder for a covstream byte stream.
///
/// # Examples
///
/// ```rust
/// use covstream_core::protocol::{encode_block, Block, BlockReader};
///
/// let mut bytes = Vec::new();
/// encode_block(&Block::CmdOk, &mut bytes);
///
/// let mut reader = BlockReader::new();
/// assert_eq!(reader.next_block().unwrap(), None);
/// reader.push(&bytes);
/// assert_eq!(reader.next_block().unwrap(), Some(Block::CmdOk));
/// ```
#[derive(Debug, Default)]
pub struct BlockReader {
    buf: Vec<u8>,
}

impl BlockReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(4096),
        }
    }

    /// Appends freshly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a decoded block.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete block, or `None` if more bytes are needed.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError`] for malformed data.  The stream cannot be
    /// resynchronised after that because blocks carry no length prefix.
    pub fn next_block(&mut self) -> Result<Option<Block>, ProtocolError> {
        match decode_block(&self.buf) {
            Ok((block, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(block))
            }
            Err(ProtocolError::InsufficientData { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

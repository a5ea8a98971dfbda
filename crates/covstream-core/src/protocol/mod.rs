//! Protocol module containing block types, the binary codec and the
//! streaming block reader.

pub mod blocks;
pub mod codec;
pub mod reader;

pub use blocks::*;
pub use codec::{decode_block, encode_block, encode_blocks, ProtocolError};
pub use reader::BlockReader;

//! Integration tests for the covstream-core protocol.
//!
//! These tests replay the byte streams exchanged during a dump request
//! through the public API, exercising the store, the codec and the streaming
//! reader together.

use covstream_core::protocol::{encode_blocks, Block, BlockReader};
use covstream_core::{ExecutionDataSource, ExecutionStore};

/// Drains every complete block out of `reader`.
fn drain(reader: &mut BlockReader) -> Vec<Block> {
    let mut blocks = Vec::new();
    while let Some(block) = reader.next_block().expect("stream must be well-formed") {
        blocks.push(block);
    }
    blocks
}

/// The server's reply to `CmdDump` is its snapshot followed by `CmdOk`,
/// written as one buffer.  A collector reading it in arbitrary chunk sizes
/// must see the same block sequence.
#[test]
fn test_dump_reply_survives_arbitrary_chunking() {
    // Arrange
    let store = ExecutionStore::new("it-session");
    store.register(1, "pkg/One", 5);
    store.register(2, "pkg/Two", 17);
    store.hit(1, 0);
    store.hit(2, 16);

    let mut reply = store.serialize_current();
    reply.extend(encode_blocks(&[Block::CmdOk]));

    for chunk_size in [1usize, 3, 7, reply.len()] {
        // Act
        let mut reader = BlockReader::new();
        let mut blocks = Vec::new();
        for chunk in reply.chunks(chunk_size) {
            reader.push(chunk);
            blocks.extend(drain(&mut reader));
        }

        // Assert
        assert_eq!(blocks.len(), 4, "chunk size {chunk_size}");
        assert!(matches!(&blocks[0], Block::SessionInfo(info) if info.id == "it-session"));
        assert!(matches!(&blocks[1], Block::ExecutionData(r) if r.name == "pkg/One"));
        assert!(matches!(&blocks[2], Block::ExecutionData(r) if r.probes[16]));
        assert_eq!(blocks[3], Block::CmdOk);
    }
}

/// A reset between two snapshots leaves only the session info in the second.
#[test]
fn test_snapshot_after_reset_contains_no_records() {
    let store = ExecutionStore::new("it-reset");
    store.register(9, "pkg/Nine", 2);
    store.hit(9, 1);

    store.reset();

    let mut reader = BlockReader::new();
    reader.push(&store.serialize_current());
    let blocks = drain(&mut reader);
    assert_eq!(blocks.len(), 1);
    assert!(matches!(blocks[0], Block::SessionInfo(_)));
}

//! Collector client: the side that connects to an agent and pulls data.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use covstream_core::protocol::{encode_blocks, Block, BlockReader, BlockType};
use covstream_core::{ExecutionRecord, ProtocolError, SessionInfo};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("agent sent {0:?} where it was not expected")]
    UnexpectedBlock(BlockType),
    #[error("malformed data from agent: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("connection I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("agent closed the connection")]
    Closed,
    #[error("timed out waiting for the agent")]
    Timeout,
}

/// Execution data received from an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionDump {
    pub sessions: Vec<SessionInfo>,
    pub records: Vec<ExecutionRecord>,
}

impl ExecutionDump {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.records.is_empty()
    }

    /// Encodes the dump as a standalone stream (header first), suitable for
    /// writing to a file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let blocks: Vec<Block> = std::iter::once(Block::Header)
            .chain(self.sessions.iter().cloned().map(Block::SessionInfo))
            .chain(self.records.iter().cloned().map(Block::ExecutionData))
            .collect();
        encode_blocks(&blocks)
    }

    /// Adds a data block; any other block is handed back.
    fn absorb(&mut self, block: Block) -> Result<(), Block> {
        match block {
            Block::SessionInfo(info) => self.sessions.push(info),
            Block::ExecutionData(record) => self.records.push(record),
            other => return Err(other),
        }
        Ok(())
    }
}

/// A connection to an agent's execution data server.
#[derive(Debug)]
pub struct Collector {
    stream: TcpStream,
    reader: BlockReader,
    buf: Vec<u8>,
}

impl Collector {
    /// Connects and exchanges headers.
    ///
    /// The agent only sends its header once it starts serving this
    /// connection, so this waits while another collector is being served.
    pub async fn connect(addr: SocketAddr) -> Result<Self, CollectorError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| CollectorError::Connect { addr, source })?;
        let mut collector = Self {
            stream,
            reader: BlockReader::new(),
            buf: vec![0u8; 4096],
        };
        collector.send(&[Block::Header]).await?;
        match collector.read_block().await? {
            Block::Header => {}
            other => return Err(CollectorError::UnexpectedBlock(other.block_type())),
        }
        debug!(%addr, "connected to agent");
        Ok(collector)
    }

    /// Asks the agent for a dump and collects it up to the acknowledgement.
    pub async fn request_dump(&mut self, reset: bool) -> Result<ExecutionDump, CollectorError> {
        self.send(&[Block::CmdDump { dump: true, reset }]).await?;
        let mut dump = ExecutionDump::default();
        loop {
            match self.read_block().await? {
                Block::CmdOk => return Ok(dump),
                block => dump
                    .absorb(block)
                    .map_err(|other| CollectorError::UnexpectedBlock(other.block_type()))?,
            }
        }
    }

    /// Asks the agent to clear its data without sending it.
    pub async fn request_reset(&mut self) -> Result<(), CollectorError> {
        self.send(&[Block::CmdDump {
            dump: false,
            reset: true,
        }])
        .await?;
        match self.read_block().await? {
            Block::CmdOk => Ok(()),
            other => Err(CollectorError::UnexpectedBlock(other.block_type())),
        }
    }

    /// Waits at most `wait` for the next block from the agent.
    pub async fn next_block(&mut self, wait: Duration) -> Result<Block, CollectorError> {
        timeout(wait, self.read_block())
            .await
            .map_err(|_| CollectorError::Timeout)?
    }

    /// Collects agent-initiated snapshots until nothing arrives for `idle`
    /// or the agent disconnects.
    pub async fn collect_until_idle(
        &mut self,
        idle: Duration,
    ) -> Result<ExecutionDump, CollectorError> {
        let mut dump = ExecutionDump::default();
        loop {
            match self.next_block(idle).await {
                Ok(block) => dump
                    .absorb(block)
                    .map_err(|other| CollectorError::UnexpectedBlock(other.block_type()))?,
                Err(CollectorError::Timeout | CollectorError::Closed) => return Ok(dump),
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(&mut self, blocks: &[Block]) -> Result<(), CollectorError> {
        self.stream.write_all(&encode_blocks(blocks)).await?;
        Ok(())
    }

    /// Cancel safe: partial blocks stay buffered in `reader`.
    async fn read_block(&mut self) -> Result<Block, CollectorError> {
        loop {
            if let Some(block) = self.reader.next_block()? {
                return Ok(block);
            }
            let n = self.stream.read(&mut self.buf).await?;
            if n == 0 {
                return Err(CollectorError::Closed);
            }
            self.reader.push(&self.buf[..n]);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use covstream_core::protocol::decode_block;
    use tokio::net::TcpListener;

    fn record(id: i64) -> ExecutionRecord {
        ExecutionRecord {
            class_id: id,
            name: format!("c/C{id}"),
            probes: vec![true],
        }
    }

    /// Fake agent that handshakes and then writes `script` verbatim.
    async fn fake_agent(script: Vec<Block>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut header = [0u8; 5];
            stream.read_exact(&mut header).await.unwrap();
            let mut out = encode_blocks(&[Block::Header]);
            out.extend(encode_blocks(&script));
            stream.write_all(&out).await.unwrap();
            // Keep the connection open until the client hangs up.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });
        addr
    }

    #[test]
    fn test_dump_to_bytes_starts_with_header() {
        let dump = ExecutionDump {
            sessions: vec![],
            records: vec![record(1)],
        };
        let bytes = dump.to_bytes();
        let (first, used) = decode_block(&bytes).unwrap();
        assert_eq!(first, Block::Header);
        let (second, _) = decode_block(&bytes[used..]).unwrap();
        assert_eq!(second, Block::ExecutionData(record(1)));
    }

    #[tokio::test]
    async fn test_connect_to_silent_port_times_out_at_caller() {
        // A listener that never accepts: the handshake cannot complete.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempt = timeout(Duration::from_millis(200), Collector::connect(addr)).await;
        assert!(attempt.is_err());
    }

    #[tokio::test]
    async fn test_collect_until_idle_gathers_data_blocks() {
        let info = SessionInfo {
            id: "s".into(),
            start_ms: 1,
            dump_ms: 2,
        };
        let addr = fake_agent(vec![
            Block::SessionInfo(info.clone()),
            Block::ExecutionData(record(7)),
        ])
        .await;

        let mut collector = Collector::connect(addr).await.unwrap();
        let dump = collector
            .collect_until_idle(Duration::from_millis(200))
            .await
            .unwrap();

        assert_eq!(dump.sessions, vec![info]);
        assert_eq!(dump.records, vec![record(7)]);
    }

    #[tokio::test]
    async fn test_unexpected_block_is_reported() {
        let addr = fake_agent(vec![Block::CmdDump {
            dump: true,
            reset: false,
        }])
        .await;

        let mut collector = Collector::connect(addr).await.unwrap();
        let result = collector.collect_until_idle(Duration::from_secs(1)).await;

        assert!(matches!(
            result,
            Err(CollectorError::UnexpectedBlock(BlockType::CmdDump))
        ));
    }
}

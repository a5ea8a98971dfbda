//! One connected collector.
//!
//! # Conversation
//!
//! ```text
//! agent                               collector
//!   │ ── Header ──────────────────────►  │   open()
//!   │ ◄────────────────────── Header ──  │   serve(): handshake
//!   │ ◄──────── CmdDump{dump, reset} ──  │   serve(): command loop
//!   │ ── [SessionInfo, ExecutionData*] │
//!   │    CmdOk ──────────────────────►  │
//!   │ ── SessionInfo, ExecutionData* ─►  │   write_snapshot(): agent-initiated
//! ```
//!
//! Every reply and every snapshot goes out in a single `write_all` under the
//! writer lock, so a command reply and an agent-initiated snapshot never
//! interleave on the wire.
//!
//! # Closing
//!
//! [`Session::close`] is synchronous and idempotent.  It shuts the socket
//! down in both directions through a duplicated handle, which makes a read
//! blocked in [`Session::serve`] return end-of-stream and makes a pending
//! write fail.  The owning accept loop can then move on to the next
//! connection.
//!
//! Snapshots are only written between a completed [`Session::open`] and
//! [`Session::close`]; outside that window they are dropped without error.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use covstream_core::protocol::{encode_block, encode_blocks, Block, BlockReader, BlockType};
use covstream_core::{ExecutionDataSource, ProtocolError};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("session is already being served")]
    AlreadyServing,
    #[error("collector sent {0:?} where it was not expected")]
    UnexpectedBlock(BlockType),
    #[error("malformed data from collector: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("session I/O failed: {0}")]
    Io(#[from] io::Error),
}

/// A connected collector and the execution data it may read.
pub struct Session {
    peer: SocketAddr,
    data: Arc<dyn ExecutionDataSource>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    /// Duplicate of the socket handle, used only to shut the socket down.
    closer: std::net::TcpStream,
    /// Set once the header has been written, under the writer lock.
    opened: AtomicBool,
    closed: AtomicBool,
}

impl Session {
    /// Wraps an accepted connection.  Must be called from within a Tokio
    /// runtime.
    pub fn new(
        stream: TcpStream,
        peer: SocketAddr,
        data: Arc<dyn ExecutionDataSource>,
    ) -> Result<Self, SessionError> {
        let std_stream = stream.into_std()?;
        let closer = std_stream.try_clone()?;
        let stream = TcpStream::from_std(std_stream)?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            peer,
            data,
            reader: Mutex::new(Some(read_half)),
            writer: Mutex::new(write_half),
            closer,
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends this side's header block.  Snapshots written before this
    /// completes are dropped.
    pub async fn open(&self) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        self.write_locked(&mut writer, &encode_blocks(&[Block::Header]))
            .await?;
        self.opened.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs the handshake and command loop until the collector disconnects
    /// or the session is closed.
    ///
    /// Returns `Ok(())` on end-of-stream, including the end-of-stream caused
    /// by [`close`](Self::close).  Can only be called once.
    pub async fn serve(&self) -> Result<(), SessionError> {
        let mut read_half = self
            .reader
            .lock()
            .await
            .take()
            .ok_or(SessionError::AlreadyServing)?;
        let mut blocks = BlockReader::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut handshake_done = false;

        loop {
            while let Some(block) = blocks.next_block()? {
                if !handshake_done {
                    if block != Block::Header {
                        return Err(SessionError::UnexpectedBlock(block.block_type()));
                    }
                    handshake_done = true;
                    debug!(peer = %self.peer, "collector handshake complete");
                    continue;
                }
                match self.handle_command(block).await {
                    // Closed underneath us; same as end-of-stream.
                    Err(SessionError::Closed) => return Ok(()),
                    other => other?,
                }
            }

            let n = match read_half.read(&mut buf).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(_) if self.is_closed() => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            blocks.push(&buf[..n]);
        }
    }

    /// Writes the current execution data, then resets it if `reset` is set
    /// and the write succeeded.
    ///
    /// Does nothing, successfully, if the header has not been sent yet or the
    /// session is closed.
    ///
    /// # Errors
    ///
    /// [`SessionError::Io`] if the write failed, in which case the session
    /// is closed as well.
    pub async fn write_snapshot(&self, reset: bool) -> Result<(), SessionError> {
        let mut writer = self.writer.lock().await;
        if !self.opened.load(Ordering::Acquire) {
            trace!(peer = %self.peer, "snapshot dropped: header not sent yet");
            return Ok(());
        }
        if self.is_closed() {
            debug!(peer = %self.peer, "snapshot dropped: session closed");
            return Ok(());
        }

        let snapshot = self.data.serialize_current();
        self.write_locked(&mut writer, &snapshot).await?;
        if reset {
            self.data.reset();
        }
        trace!(peer = %self.peer, bytes = snapshot.len(), reset, "snapshot written");
        Ok(())
    }

    /// Shuts the socket down.  Safe to call any number of times from any
    /// thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.closer.shutdown(Shutdown::Both) {
            Ok(()) => debug!(peer = %self.peer, "session closed"),
            // The peer may have gone away already.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
            Err(e) => debug!(peer = %self.peer, "session shutdown failed: {e}"),
        }
    }

    async fn handle_command(&self, block: Block) -> Result<(), SessionError> {
        let Block::CmdDump { dump, reset } = block else {
            return Err(SessionError::UnexpectedBlock(block.block_type()));
        };
        debug!(peer = %self.peer, dump, reset, "collector command");

        // Serialize, send and reset under the writer lock so a concurrent
        // snapshot cannot slip between them.
        let mut writer = self.writer.lock().await;
        let mut reply = if dump {
            self.data.serialize_current()
        } else {
            Vec::new()
        };
        encode_block(&Block::CmdOk, &mut reply);
        self.write_locked(&mut writer, &reply).await?;
        if reset {
            self.data.reset();
        }
        Ok(())
    }

    /// Writes `bytes` in one `write_all`; the caller holds the writer lock.
    async fn write_locked(
        &self,
        writer: &mut OwnedWriteHalf,
        bytes: &[u8],
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let written = match writer.write_all(bytes).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            self.close();
            return Err(SessionError::Io(e));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

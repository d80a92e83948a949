//! Connection abstraction and length-prefixed framing.
//!
//! A [`Conn`] exchanges discrete messages with one peer. Reads are driven by
//! the owning session's read loop; writes are queued to a per-connection
//! writer and never block the caller. Three implementations exist:
//!
//! * [`TcpConn`] - length-prefixed frames over a TCP stream
//! * [`WsConn`] - one binary WebSocket message per frame
//! * [`MemoryConn`] - an in-process pair for tests and embedding

mod memory;
mod tcp;
mod ws;

pub use memory::MemoryConn;
pub use tcp::TcpConn;
pub use ws::WsConn;
pub(crate) use ws::read_limits;

use crate::config::ByteOrder;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Duplex message channel to one peer.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Waits for the next complete message.
    ///
    /// Any error is terminal: the connection is unusable afterwards.
    async fn read_message(&self) -> Result<Vec<u8>, TransportError>;

    /// Queues the frames of one message for writing.
    ///
    /// Frames are concatenated into a single message. When the pending write
    /// queue is full the connection is destroyed.
    fn write_message(&self, frames: &[Vec<u8>]) -> Result<(), TransportError>;

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Flushes queued writes, then shuts the connection down.
    fn close(&self);

    /// Shuts the connection down immediately, dropping queued writes.
    fn destroy(&self);
}

/// Length-prefixed message framing.
///
/// ```text
/// --------------
/// | len | data |
/// --------------
/// ```
///
/// `len` is 1, 2 or 4 bytes wide and covers only `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgParser {
    len_msg_len: usize,
    min_msg_len: u32,
    max_msg_len: u32,
    byte_order: ByteOrder,
}

impl Default for MsgParser {
    fn default() -> Self {
        Self {
            len_msg_len: 2,
            min_msg_len: 1,
            max_msg_len: 4096,
            byte_order: ByteOrder::BigEndian,
        }
    }
}

impl MsgParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the prefix width and the accepted message length range.
    ///
    /// Unsupported widths keep the current one. A zero bound keeps the
    /// current bound. The maximum is clamped to what the prefix can express.
    pub fn with_msg_len(mut self, len_msg_len: usize, min_msg_len: u32, max_msg_len: u32) -> Self {
        if matches!(len_msg_len, 1 | 2 | 4) {
            self.len_msg_len = len_msg_len;
        } else {
            warn!("unsupported length prefix width {}, keeping {}", len_msg_len, self.len_msg_len);
        }
        if min_msg_len != 0 {
            self.min_msg_len = min_msg_len;
        }
        if max_msg_len != 0 {
            self.max_msg_len = max_msg_len;
        }

        let limit = match self.len_msg_len {
            1 => u8::MAX as u32,
            2 => u16::MAX as u32,
            _ => u32::MAX,
        };
        self.max_msg_len = self.max_msg_len.min(limit);
        self.min_msg_len = self.min_msg_len.min(self.max_msg_len);
        self
    }

    pub fn with_byte_order(mut self, byte_order: ByteOrder) -> Self {
        self.byte_order = byte_order;
        self
    }

    pub fn max_msg_len(&self) -> u32 {
        self.max_msg_len
    }

    fn check_len(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_msg_len as usize {
            return Err(TransportError::MessageTooLong {
                len,
                max: self.max_msg_len as usize,
            });
        }
        if len < self.min_msg_len as usize {
            return Err(TransportError::MessageTooShort {
                len,
                min: self.min_msg_len as usize,
            });
        }
        Ok(())
    }

    /// Reads one message from `reader`.
    pub async fn read<R>(&self, reader: &mut R) -> Result<Vec<u8>, TransportError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut prefix = [0u8; 4];
        let prefix = &mut prefix[..self.len_msg_len];
        reader.read_exact(prefix).await?;

        let len = match self.len_msg_len {
            1 => prefix[0] as usize,
            2 => self.byte_order.u16_from_bytes([prefix[0], prefix[1]]) as usize,
            _ => self
                .byte_order
                .u32_from_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize,
        };
        self.check_len(len)?;

        let mut data = vec![0u8; len];
        reader.read_exact(&mut data).await?;
        Ok(data)
    }

    /// Encodes the frames of one message behind a single length prefix.
    pub fn encode(&self, frames: &[Vec<u8>]) -> Result<Vec<u8>, TransportError> {
        let len: usize = frames.iter().map(Vec::len).sum();
        self.check_len(len)?;

        let mut message = Vec::with_capacity(self.len_msg_len + len);
        match self.len_msg_len {
            1 => message.push(len as u8),
            2 => message.extend_from_slice(&self.byte_order.u16_to_bytes(len as u16)),
            _ => message.extend_from_slice(&self.byte_order.u32_to_bytes(len as u32)),
        }
        for frame in frames {
            message.extend_from_slice(frame);
        }
        Ok(message)
    }
}

/// Joins the frames of one message, enforcing `max_msg_len`.
pub(crate) fn join_frames(frames: &[Vec<u8>], max_msg_len: u32) -> Result<Vec<u8>, TransportError> {
    let len: usize = frames.iter().map(Vec::len).sum();
    if len > max_msg_len as usize {
        return Err(TransportError::MessageTooLong {
            len,
            max: max_msg_len as usize,
        });
    }
    Ok(frames.concat())
}

/// Bounded queue feeding a connection's writer task.
///
/// Dropping the sender lets the writer drain and finish; cancelling `shutdown`
/// stops reader and writer at once.
pub(crate) struct Outbox {
    sender: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    shutdown: CancellationToken,
}

impl Outbox {
    pub(crate) fn new(pending_write_num: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(pending_write_num.max(1));
        let outbox = Self {
            sender: Mutex::new(Some(sender)),
            shutdown: CancellationToken::new(),
        };
        (outbox, receiver)
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn push(&self, message: Vec<u8>) -> Result<(), TransportError> {
        let result = match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(message),
            None => return Err(TransportError::Closed),
        };
        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!("pending write queue full, destroying connection");
                self.destroy();
                Err(TransportError::WriteQueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    pub(crate) fn close(&self) {
        self.sender.lock().take();
    }

    pub(crate) fn destroy(&self) {
        self.sender.lock().take();
        self.shutdown.cancel();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

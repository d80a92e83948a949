use super::{Conn, MsgParser, Outbox};
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Length-prefixed messages over a TCP stream.
pub struct TcpConn {
    reader: Mutex<BufReader<OwnedReadHalf>>,
    parser: MsgParser,
    outbox: Outbox,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl TcpConn {
    /// Wraps `stream` and spawns its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        stream: TcpStream,
        parser: MsgParser,
        pending_write_num: usize,
    ) -> Result<Arc<Self>, TransportError> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (outbox, receiver) = Outbox::new(pending_write_num);
        tokio::spawn(write_loop(write_half, receiver, outbox.shutdown_token()));

        Ok(Arc::new(Self {
            reader: Mutex::new(BufReader::new(read_half)),
            parser,
            outbox,
            local_addr,
            remote_addr,
        }))
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => {
                    if let Err(e) = writer.write_all(&message).await {
                        debug!("tcp write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = writer.shutdown().await;
    shutdown.cancel();
}

#[async_trait]
impl Conn for TcpConn {
    async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        let shutdown = self.outbox.shutdown_token();
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = shutdown.cancelled() => Err(TransportError::Closed),
            result = self.parser.read(&mut *reader) => result,
        }
    }

    fn write_message(&self, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let message = self.parser.encode(frames)?;
        self.outbox.push(message)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn close(&self) {
        self.outbox.close();
    }

    fn destroy(&self) {
        self.outbox.destroy();
    }
}

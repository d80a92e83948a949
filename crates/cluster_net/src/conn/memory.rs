use super::{join_frames, Conn};
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// In-process connection. Messages written on one end are read on the other.
///
/// Each direction is bounded by `pending_write_num`; a writer that fills it is
/// destroyed just like a slow TCP peer would be.
pub struct MemoryConn {
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    shutdown: CancellationToken,
    max_msg_len: u32,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl MemoryConn {
    /// Creates two connected ends.
    pub fn pair(pending_write_num: usize, max_msg_len: u32) -> (Arc<MemoryConn>, Arc<MemoryConn>) {
        let (a_tx, a_rx) = mpsc::channel(pending_write_num.max(1));
        let (b_tx, b_rx) = mpsc::channel(pending_write_num.max(1));
        let a_addr = SocketAddr::from(([127, 0, 0, 1], 1));
        let b_addr = SocketAddr::from(([127, 0, 0, 1], 2));

        let a = Arc::new(MemoryConn {
            inbound: tokio::sync::Mutex::new(b_rx),
            outbound: Mutex::new(Some(a_tx)),
            shutdown: CancellationToken::new(),
            max_msg_len,
            local_addr: a_addr,
            remote_addr: b_addr,
        });
        let b = Arc::new(MemoryConn {
            inbound: tokio::sync::Mutex::new(a_rx),
            outbound: Mutex::new(Some(b_tx)),
            shutdown: CancellationToken::new(),
            max_msg_len,
            local_addr: b_addr,
            remote_addr: a_addr,
        });
        (a, b)
    }
}

#[async_trait]
impl Conn for MemoryConn {
    async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            message = inbound.recv() => message.ok_or(TransportError::Closed),
        }
    }

    fn write_message(&self, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let message = join_frames(frames, self.max_msg_len)?;
        let result = match self.outbound.lock().as_ref() {
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

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn close(&self) {
        // Already queued messages stay readable by the peer.
        self.outbound.lock().take();
        self.shutdown.cancel();
    }

    fn destroy(&self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_exchanges_messages() {
        let (a, b) = MemoryConn::pair(4, 1024);
        a.write_message(&[b"he".to_vec(), b"llo".to_vec()]).unwrap();
        assert_eq!(b.read_message().await.unwrap(), b"hello".to_vec());
        assert_eq!(a.remote_addr(), b.local_addr());
    }

    #[tokio::test]
    async fn test_close_ends_both_readers() {
        let (a, b) = MemoryConn::pair(4, 1024);
        a.write_message(&[b"last".to_vec()]).unwrap();
        a.close();

        assert!(matches!(a.read_message().await, Err(TransportError::Closed)));
        assert_eq!(b.read_message().await.unwrap(), b"last".to_vec());
        assert!(matches!(b.read_message().await, Err(TransportError::Closed)));
        assert!(matches!(
            a.write_message(&[vec![1]]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_full_queue_destroys() {
        let (a, _b) = MemoryConn::pair(1, 1024);
        a.write_message(&[vec![1]]).unwrap();
        assert!(matches!(
            a.write_message(&[vec![2]]),
            Err(TransportError::WriteQueueFull)
        ));
        assert!(a.shutdown.is_cancelled());
    }
}

use super::{join_frames, Conn, Outbox};
use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Protocol limits applied while reading, so an oversized message fails
/// before it is buffered.
pub(crate) fn read_limits(max_msg_len: u32) -> WebSocketConfig {
    let max = Some(max_msg_len as usize);
    WebSocketConfig::default()
        .max_message_size(max)
        .max_frame_size(max)
}

/// One binary WebSocket message per application message.
///
/// `S` is the byte stream under the WebSocket: a plain [`TcpStream`] or a TLS
/// stream wrapping one.
pub struct WsConn<S = TcpStream> {
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    max_msg_len: u32,
    outbox: Outbox,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
}

impl<S> WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps an upgraded stream and spawns its writer task.
    pub fn new(
        ws_stream: WebSocketStream<S>,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        max_msg_len: u32,
        pending_write_num: usize,
    ) -> Arc<Self> {
        let (sink, stream) = ws_stream.split();
        let (outbox, receiver) = Outbox::new(pending_write_num);
        tokio::spawn(write_loop(sink, receiver, outbox.shutdown_token()));

        Arc::new(Self {
            stream: Mutex::new(stream),
            max_msg_len,
            outbox,
            local_addr,
            remote_addr,
        })
    }

    fn check_len(&self, data: Vec<u8>) -> Result<Vec<u8>, TransportError> {
        if data.len() > self.max_msg_len as usize {
            return Err(TransportError::MessageTooLong {
                len: data.len(),
                max: self.max_msg_len as usize,
            });
        }
        Ok(data)
    }
}

async fn write_loop<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = receiver.recv() => match message {
                Some(message) => {
                    if let Err(e) = sink.send(Message::binary(message)).await {
                        debug!("websocket write failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let _ = sink.close().await;
    shutdown.cancel();
}

#[async_trait]
impl<S> Conn for WsConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn read_message(&self) -> Result<Vec<u8>, TransportError> {
        let shutdown = self.outbox.shutdown_token();
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => return Err(TransportError::Closed),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => return self.check_len(data.to_vec()),
                Some(Ok(Message::Text(text))) => {
                    return self.check_len(text.as_str().as_bytes().to_vec())
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    fn write_message(&self, frames: &[Vec<u8>]) -> Result<(), TransportError> {
        let message = join_frames(frames, self.max_msg_len)?;
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

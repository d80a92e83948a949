use super::{bind_listener, AcceptBackoff, ListenerState, NewAgent};
use crate::conn::{read_limits, Conn, WsConn};
use crate::error::{ServerError, TransportError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::accept_async_with_config;
use tracing::{debug, info, warn};

/// WebSocket listener producing one agent per upgraded connection.
pub struct WsServer {
    local_addr: SocketAddr,
    state: Arc<ListenerState>,
}

#[derive(Clone)]
struct UpgradeSettings {
    max_conn_num: usize,
    pending_write_num: usize,
    max_msg_len: u32,
    http_timeout: Duration,
    tls: Option<TlsAcceptor>,
    new_agent: NewAgent,
}

/// Holds one connection slot from accept until the session is tracked.
struct SlotReservation(Arc<AtomicUsize>);

impl SlotReservation {
    fn new(upgrading: &Arc<AtomicUsize>) -> Self {
        upgrading.fetch_add(1, Ordering::AcqRel);
        Self(upgrading.clone())
    }
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl WsServer {
    /// Binds `addr` and starts accepting WebSocket upgrades.
    ///
    /// The upgrade handshake of each connection, including the TLS handshake
    /// when `tls` is set, must finish within `http_timeout`; slower clients
    /// are dropped. Messages longer than `max_msg_len` fail while reading.
    pub async fn start(
        addr: &str,
        max_conn_num: usize,
        pending_write_num: usize,
        max_msg_len: u32,
        http_timeout: Duration,
        tls: Option<TlsAcceptor>,
        new_agent: NewAgent,
    ) -> Result<Self, ServerError> {
        let listener = bind_listener(addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address unavailable: {e}")))?;

        let secure = tls.is_some();
        let state = Arc::new(ListenerState::new());
        let settings = UpgradeSettings {
            max_conn_num,
            pending_write_num,
            max_msg_len,
            http_timeout,
            tls,
            new_agent,
        };
        let handle = tokio::spawn(accept_loop(listener, state.clone(), settings));
        state.set_accept_task(handle);

        let scheme = if secure { "wss" } else { "ws" };
        info!("✅ WebSocket listener bound on {}://{}", scheme, local_addr);
        Ok(Self { local_addr, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conn_count(&self) -> usize {
        self.state.conn_count()
    }

    pub async fn close(&self) {
        self.state.close().await;
        info!("WebSocket listener on {} closed", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ListenerState>, settings: UpgradeSettings) {
    let mut backoff = AcceptBackoff::new();
    let upgrading = Arc::new(AtomicUsize::new(0));
    loop {
        let accepted = tokio::select! {
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, remote_addr) = match accepted {
            Ok(pair) => {
                backoff.reset();
                pair
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("accept error: {}; retrying in {:?}", e, delay);
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        // Upgrades still in flight count against the cap.
        if state.conn_count() + upgrading.load(Ordering::Acquire) >= settings.max_conn_num {
            debug!("too many connections, dropping {}", remote_addr);
            continue;
        }

        let slot = SlotReservation::new(&upgrading);
        let upgrade_state = state.clone();
        let settings = settings.clone();
        state.tracker.spawn(async move {
            match upgrade(stream, remote_addr, &settings).await {
                Ok(conn) => {
                    if upgrade_state.shutdown.is_cancelled() {
                        conn.destroy();
                        return;
                    }
                    let agent = (settings.new_agent)(conn.clone());
                    upgrade_state.spawn_session(remote_addr, conn, agent);
                }
                Err(e) => debug!("websocket upgrade from {} failed: {}", remote_addr, e),
            }
            drop(slot);
        });
    }
}

async fn upgrade(
    stream: TcpStream,
    remote_addr: SocketAddr,
    settings: &UpgradeSettings,
) -> Result<Arc<dyn Conn>, TransportError> {
    let local_addr = stream.local_addr()?;
    let handshake = async {
        match &settings.tls {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                websocket(stream, local_addr, remote_addr, settings).await
            }
            None => websocket(stream, local_addr, remote_addr, settings).await,
        }
    };

    tokio::time::timeout(settings.http_timeout, handshake)
        .await
        .map_err(|_| TransportError::HandshakeTimeout)?
}

async fn websocket<S>(
    stream: S,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    settings: &UpgradeSettings,
) -> Result<Arc<dyn Conn>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ws_stream = accept_async_with_config(stream, Some(read_limits(settings.max_msg_len))).await?;
    let conn: Arc<dyn Conn> = WsConn::new(
        ws_stream,
        local_addr,
        remote_addr,
        settings.max_msg_len,
        settings.pending_write_num,
    );
    Ok(conn)
}

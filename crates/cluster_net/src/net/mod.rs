//! Listeners and the uplink dialer.
//!
//! Each accepted or dialed connection gets its own task running an
//! [`Agent`](crate::Agent) produced by a [`NewAgent`] factory. Listener tasks are
//! tracked so `close` can wait for every session to finish.

mod tcp_client;
mod tcp_server;
mod tls;
mod ws_server;

pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
pub use tls::load_tls_acceptor;
pub use ws_server::WsServer;

use crate::agent::Agent;
use crate::conn::Conn;
use crate::error::ServerError;
use dashmap::DashMap;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Builds the session for a new connection.
pub type NewAgent = Arc<dyn Fn(Arc<dyn Conn>) -> Arc<Agent> + Send + Sync>;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub(crate) async fn resolve(addr: &str) -> Result<SocketAddr, ServerError> {
    tokio::net::lookup_host(addr)
        .await
        .map_err(|e| ServerError::Network(format!("Resolve {addr} failed: {e}")))?
        .next()
        .ok_or_else(|| ServerError::Network(format!("No address found for {addr}")))
}

/// Binds a non-blocking listener with address reuse enabled.
pub(crate) async fn bind_listener(addr: &str) -> Result<TcpListener, ServerError> {
    let addr = resolve(addr).await?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
    socket.set_reuse_address(true).ok();

    socket
        .bind(&addr.into())
        .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
    socket
        .listen(1024)
        .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;

    let std_listener: StdTcpListener = socket.into();
    std_listener
        .set_nonblocking(true)
        .map_err(|e| ServerError::Network(format!("Set nonblocking failed: {e}")))?;
    TcpListener::from_std(std_listener)
        .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))
}

/// Doubling delay after a failed accept, reset by the next success.
pub(crate) struct AcceptBackoff {
    delay: Option<Duration>,
}

impl AcceptBackoff {
    pub(crate) fn new() -> Self {
        Self { delay: None }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.delay {
            None => ACCEPT_BACKOFF_MIN,
            Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
        };
        self.delay = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.delay = None;
    }
}

/// Shutdown plumbing shared by the listeners.
pub(crate) struct ListenerState {
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
    pub(crate) conns: Arc<DashMap<SocketAddr, Arc<dyn Conn>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ListenerState {
    pub(crate) fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            conns: Arc::new(DashMap::new()),
            accept_task: Mutex::new(None),
        }
    }

    pub(crate) fn set_accept_task(&self, handle: JoinHandle<()>) {
        *self.accept_task.lock() = Some(handle);
    }

    /// Runs `agent` on a tracked task, forgetting its connection afterwards.
    pub(crate) fn spawn_session(&self, remote_addr: SocketAddr, conn: Arc<dyn Conn>, agent: Arc<Agent>) {
        self.conns.insert(remote_addr, conn.clone());
        if self.shutdown.is_cancelled() {
            conn.close();
        }
        let conns = self.conns.clone();
        self.tracker.spawn(async move {
            agent.serve().await;
            conns.remove(&remote_addr);
            debug!("session {} finished", remote_addr);
        });
    }

    /// Stops accepting, closes every live connection and waits for all sessions.
    pub(crate) async fn close(&self) {
        self.shutdown.cancel();
        let accept_task = self.accept_task.lock().take();
        if let Some(handle) = accept_task {
            if let Err(e) = handle.await {
                warn!("accept loop ended abnormally: {}", e);
            }
        }

        let live: Vec<Arc<dyn Conn>> = self
            .conns
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in live {
            conn.close();
        }

        self.tracker.close();
        self.tracker.wait().await;
        self.conns.clear();
    }

    pub(crate) fn conn_count(&self) -> usize {
        self.conns.len()
    }
}

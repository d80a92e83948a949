use super::{bind_listener, AcceptBackoff, ListenerState, NewAgent};
use crate::conn::{Conn, MsgParser, TcpConn};
use crate::error::ServerError;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// TCP listener producing one agent per accepted connection.
pub struct TcpServer {
    local_addr: SocketAddr,
    state: Arc<ListenerState>,
}

struct AcceptSettings {
    max_conn_num: usize,
    pending_write_num: usize,
    parser: MsgParser,
    new_agent: NewAgent,
}

impl TcpServer {
    /// Binds `addr` and starts accepting.
    ///
    /// # Arguments
    ///
    /// * `addr` - Listen address, port `0` picks a free port
    /// * `max_conn_num` - Connections beyond this count are dropped on accept
    /// * `pending_write_num` - Per-connection outbound queue bound
    /// * `parser` - Length-prefix framing shared by every connection
    /// * `new_agent` - Builds the session for each connection
    pub async fn start(
        addr: &str,
        max_conn_num: usize,
        pending_write_num: usize,
        parser: MsgParser,
        new_agent: NewAgent,
    ) -> Result<Self, ServerError> {
        let listener = bind_listener(addr).await?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Network(format!("Local address unavailable: {e}")))?;

        let state = Arc::new(ListenerState::new());
        let settings = AcceptSettings {
            max_conn_num,
            pending_write_num,
            parser,
            new_agent,
        };
        let handle = tokio::spawn(accept_loop(listener, state.clone(), settings));
        state.set_accept_task(handle);

        info!("✅ TCP listener bound on {}", local_addr);
        Ok(Self { local_addr, state })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn conn_count(&self) -> usize {
        self.state.conn_count()
    }

    /// Stops accepting, closes every connection and waits for their agents.
    pub async fn close(&self) {
        self.state.close().await;
        info!("TCP listener on {} closed", self.local_addr);
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ListenerState>, settings: AcceptSettings) {
    let mut backoff = AcceptBackoff::new();
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

        if state.conn_count() >= settings.max_conn_num {
            debug!("too many connections, dropping {}", remote_addr);
            continue;
        }

        let conn: Arc<dyn Conn> = match TcpConn::new(stream, settings.parser, settings.pending_write_num) {
            Ok(conn) => conn as Arc<dyn Conn>,
            Err(e) => {
                warn!("failed to set up connection from {}: {}", remote_addr, e);
                continue;
            }
        };

        let agent = (settings.new_agent)(conn.clone());
        state.spawn_session(remote_addr, conn, agent);
    }
}

use super::NewAgent;
use crate::conn::{Conn, MsgParser, TcpConn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Single outbound connection to the master node.
///
/// A failed dial is retried once per `connect_interval` until it succeeds or
/// the client is closed. Once connected, the session runs until it ends and is
/// never re-established.
pub struct TcpClient {
    addr: String,
    shutdown: CancellationToken,
    conn: Arc<Mutex<Option<Arc<dyn Conn>>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct DialSettings {
    addr: String,
    connect_interval: Duration,
    pending_write_num: usize,
    parser: MsgParser,
    new_agent: NewAgent,
}

impl TcpClient {
    /// Starts dialing `addr` in the background.
    pub fn start(
        addr: impl Into<String>,
        connect_interval: Duration,
        pending_write_num: usize,
        parser: MsgParser,
        new_agent: NewAgent,
    ) -> Self {
        let addr = addr.into();
        let shutdown = CancellationToken::new();
        let conn = Arc::new(Mutex::new(None));
        let settings = DialSettings {
            addr: addr.clone(),
            connect_interval,
            pending_write_num,
            parser,
            new_agent,
        };
        let handle = tokio::spawn(dial_loop(settings, shutdown.clone(), conn.clone()));

        Self {
            addr,
            shutdown,
            conn,
            task: Mutex::new(Some(handle)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    /// Stops dialing, closes the session if any and waits for it to end.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            conn.close();
        }

        let task = self.task.lock().take();
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                warn!("uplink task ended abnormally: {}", e);
            }
        }
    }
}

async fn dial_loop(
    settings: DialSettings,
    shutdown: CancellationToken,
    slot: Arc<Mutex<Option<Arc<dyn Conn>>>>,
) {
    let stream = loop {
        let dialed = tokio::select! {
            _ = shutdown.cancelled() => return,
            dialed = TcpStream::connect(settings.addr.as_str()) => dialed,
        };
        match dialed {
            Ok(stream) => break stream,
            Err(e) => info!("connect to {} error: {}", settings.addr, e),
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(settings.connect_interval) => {}
        }
    };

    let conn: Arc<dyn Conn> = match TcpConn::new(stream, settings.parser, settings.pending_write_num) {
        Ok(conn) => conn as Arc<dyn Conn>,
        Err(e) => {
            warn!("failed to set up uplink to {}: {}", settings.addr, e);
            return;
        }
    };

    {
        let mut slot = slot.lock();
        if shutdown.is_cancelled() {
            conn.close();
            return;
        }
        *slot = Some(conn.clone());
    }

    info!("🔗 Connected to master at {}", settings.addr);
    let agent = (settings.new_agent)(conn);
    agent.serve().await;
    slot.lock().take();
    info!("uplink to {} ended", settings.addr);
}

//! Per-connection session driving the read loop.
//!
//! An [`Agent`] owns one [`Conn`], shares the node's [`Processor`], and keeps
//! its own ticket table so requests it issues are correlated only with
//! replies arriving on the same connection. Handlers see the agent through the
//! [`Session`] trait.
//!
//! # Lifecycle
//!
//! 1. The listener or dialer wraps an accepted connection in an `Agent`
//! 2. [`Agent::serve`] runs the read loop until the connection fails or a
//!    message cannot be decoded or routed
//! 3. The connection is closed, pending tickets are dropped and the
//!    disconnect hook runs

use crate::async_result::{AsyncResultMgr, Ticket, TicketCallback, TicketPayload};
use crate::conn::Conn;
use crate::error::CorrelationError;
use crate::processor::Processor;
use crate::session::{Session, SessionRef, UserData};
use parking_lot::RwLock;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Error type returned by the disconnect hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Hook run with a freshly created session.
pub type ConnectHook = Arc<dyn Fn(&SessionRef) + Send + Sync>;

/// Hook run once a session's read loop has ended.
pub type DisconnectHook = Arc<dyn Fn(&SessionRef) -> Result<(), HookError> + Send + Sync>;

/// One live connection as seen by the framework.
pub struct Agent {
    conn: Arc<dyn Conn>,
    processor: Option<Arc<Processor>>,
    user_data: RwLock<Option<UserData>>,
    results: AsyncResultMgr<TicketPayload>,
    on_disconnect: Option<DisconnectHook>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("local_addr", &self.conn.local_addr())
            .field("remote_addr", &self.conn.remote_addr())
            .field("pending_tickets", &self.results.len())
            .finish()
    }
}

impl Agent {
    /// Creates a session for `conn`.
    ///
    /// Without a processor the read loop still drains the connection but
    /// nothing is decoded, and writes are dropped.
    pub fn new(conn: Arc<dyn Conn>, processor: Option<Arc<Processor>>) -> Self {
        Self {
            conn,
            processor,
            user_data: RwLock::new(None),
            results: AsyncResultMgr::new(),
            on_disconnect: None,
        }
    }

    pub fn with_disconnect_hook(mut self, hook: Option<DisconnectHook>) -> Self {
        self.on_disconnect = hook;
        self
    }

    pub fn conn(&self) -> &Arc<dyn Conn> {
        &self.conn
    }

    /// This session's ticket table.
    pub fn results(&self) -> &AsyncResultMgr<TicketPayload> {
        &self.results
    }

    /// Reads, decodes and routes messages until something fails.
    ///
    /// Messages are routed in the order they were read.
    pub async fn run(self: Arc<Self>) {
        let session: SessionRef = self.clone();
        loop {
            let data = match self.conn.read_message().await {
                Ok(data) => data,
                Err(e) => {
                    debug!("read message: {}", e);
                    break;
                }
            };

            let Some(processor) = &self.processor else {
                continue;
            };

            let msg = match processor.unmarshal(&data) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("unmarshal message error: {}", e);
                    break;
                }
            };

            if let Err(e) = processor.route(msg, &session) {
                debug!("route message error: {}", e);
                break;
            }
        }
    }

    /// Drops every pending ticket, then runs the disconnect hook.
    pub fn on_close(self: &Arc<Self>) {
        let dropped = self.results.clear();
        if dropped > 0 {
            debug!(
                "dropped {} pending tickets for {}",
                dropped,
                self.conn.remote_addr()
            );
        }

        if let Some(hook) = &self.on_disconnect {
            let session: SessionRef = self.clone();
            if let Err(e) = hook(&session) {
                error!("disconnect hook error: {}", e);
            }
        }
    }

    /// Runs the read loop, then tears the session down.
    pub async fn serve(self: Arc<Self>) {
        self.clone().run().await;
        self.conn.close();
        self.on_close();
    }

    /// Sends the message built for a fresh ticket and waits for its reply.
    ///
    /// The reply is delivered by whichever handler calls
    /// [`Session::exec_ticket`] with the same ticket on this session.
    pub async fn request<F, M>(&self, build: F, timeout: Duration) -> Result<TicketPayload, CorrelationError>
    where
        F: FnOnce(Ticket) -> M,
        M: Any,
    {
        let pending = self.results.add_blocking()?;
        {
            let msg = build(pending.ticket());
            self.write_message(&msg);
        }
        pending.get_result(timeout).await
    }
}

impl Session for Agent {
    fn write_message(&self, msg: &dyn Any) {
        let Some(processor) = &self.processor else {
            return;
        };

        match processor.marshal(msg) {
            Ok(frames) => {
                if let Err(e) = self.conn.write_message(&frames) {
                    error!("write message error: {}", e);
                }
            }
            Err(e) => error!("marshal message error: {}", e),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_addr()
    }

    fn close(&self) {
        self.conn.close();
    }

    fn destroy(&self) {
        self.conn.destroy();
    }

    fn user_data(&self) -> Option<UserData> {
        self.user_data.read().clone()
    }

    fn set_user_data(&self, data: UserData) {
        *self.user_data.write() = Some(data);
    }

    fn get_ticket(&self, callback: TicketCallback) -> Option<Ticket> {
        match self.results.add(false, Some(callback)) {
            Ok(result) => Some(result.ticket()),
            Err(e) => {
                error!("get ticket error: {}", e);
                None
            }
        }
    }

    fn exec_ticket(&self, ticket: Ticket, payload: TicketPayload) -> Result<(), CorrelationError> {
        self.results.fill_async_result(ticket, payload)
    }
}

//! Server supervisor.
//!
//! [`Server`] starts the configured listeners and the master uplink, waits for
//! a shutdown signal, then stops everything in reverse start order:
//!
//! ```text
//! start:  WebSocket -> TCP -> uplink
//! stop:   uplink -> TCP -> WebSocket
//! ```
//!
//! Sessions accepted by a listener run the `on_connected` hook, the uplink
//! session runs `on_master_connected` instead. Every session runs
//! `on_disconnected` when it ends.

use crate::agent::{Agent, ConnectHook, DisconnectHook};
use crate::conn::{Conn, MsgParser};
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::net::{load_tls_acceptor, NewAgent, TcpClient, TcpServer, WsServer};
use crate::processor::Processor;
use crate::session::SessionRef;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Application callbacks around session creation and teardown.
#[derive(Clone, Default)]
pub struct ServerHooks {
    pub on_connected: Option<ConnectHook>,
    pub on_disconnected: Option<DisconnectHook>,
    pub on_master_connected: Option<ConnectHook>,
}

impl std::fmt::Debug for ServerHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHooks")
            .field("on_connected", &self.on_connected.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .field("on_master_connected", &self.on_master_connected.is_some())
            .finish()
    }
}

/// Listener and uplink supervisor for one node.
pub struct Server {
    config: ServerConfig,
    processor: Arc<Processor>,
    hooks: ServerHooks,
}

impl Server {
    pub fn new(config: ServerConfig, processor: Arc<Processor>) -> Self {
        Self {
            config,
            processor,
            hooks: ServerHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: ServerHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    fn parser(&self) -> MsgParser {
        MsgParser::new()
            .with_msg_len(self.config.len_msg_len, 1, self.config.max_msg_len)
            .with_byte_order(self.config.byte_order())
    }

    fn agent_factory(&self, on_created: Option<ConnectHook>) -> NewAgent {
        let processor = self.processor.clone();
        let on_disconnected = self.hooks.on_disconnected.clone();
        Arc::new(move |conn: Arc<dyn Conn>| {
            let agent = Arc::new(
                Agent::new(conn, Some(processor.clone()))
                    .with_disconnect_hook(on_disconnected.clone()),
            );
            if let Some(hook) = &on_created {
                let session: SessionRef = agent.clone();
                hook(&session);
            }
            agent
        })
    }

    /// Prepares the processor and starts every configured component.
    ///
    /// If a later component fails to start, the ones already running are
    /// stopped before the error is returned.
    pub async fn start(&self) -> Result<RunningServer, ServerError> {
        self.config.validate().map_err(ServerError::Config)?;
        self.processor.set_byte_order(self.config.byte_order())?;
        self.processor.seal();

        let mut running = RunningServer::default();

        if !self.config.ws_addr.is_empty() {
            let tls = if self.config.uses_tls() {
                Some(load_tls_acceptor(&self.config.cert_file, &self.config.key_file)?)
            } else {
                None
            };
            let started = WsServer::start(
                &self.config.ws_addr,
                self.config.max_conn_num,
                self.config.pending_write_num,
                self.config.max_msg_len,
                self.config.http_timeout,
                tls,
                self.agent_factory(self.hooks.on_connected.clone()),
            )
            .await;
            match started {
                Ok(ws) => running.ws = Some(ws),
                Err(e) => {
                    running.stop().await;
                    return Err(e);
                }
            }
        }

        if !self.config.tcp_addr.is_empty() {
            let started = TcpServer::start(
                &self.config.tcp_addr,
                self.config.max_conn_num,
                self.config.pending_write_num,
                self.parser(),
                self.agent_factory(self.hooks.on_connected.clone()),
            )
            .await;
            match started {
                Ok(tcp) => running.tcp = Some(tcp),
                Err(e) => {
                    running.stop().await;
                    return Err(e);
                }
            }
        }

        if self.config.wants_uplink() {
            running.uplink = Some(TcpClient::start(
                self.config.master_addr.clone(),
                self.config.connect_interval,
                self.config.pending_write_num,
                self.parser(),
                self.agent_factory(self.hooks.on_master_connected.clone()),
            ));
        }

        info!("🚀 {} server started", self.config.role);
        Ok(running)
    }

    /// Runs until `shutdown` resolves, then stops every component.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let running = self.start().await?;
        shutdown.await;
        info!("Shutdown signal received, stopping {} server", self.config.role);
        running.stop().await;
        Ok(())
    }
}

/// Components started by [`Server::start`].
#[derive(Default)]
pub struct RunningServer {
    ws: Option<WsServer>,
    tcp: Option<TcpServer>,
    uplink: Option<TcpClient>,
}

impl RunningServer {
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws.as_ref().map(WsServer::local_addr)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(TcpServer::local_addr)
    }

    pub fn uplink_connected(&self) -> bool {
        self.uplink.as_ref().is_some_and(TcpClient::is_connected)
    }

    /// Stops every component in reverse start order.
    pub async fn stop(self) {
        if let Some(uplink) = &self.uplink {
            uplink.close().await;
        }
        if let Some(tcp) = &self.tcp {
            tcp.close().await;
        }
        if let Some(ws) = &self.ws {
            ws.close().await;
        }
        info!("✅ Server stopped");
    }
}

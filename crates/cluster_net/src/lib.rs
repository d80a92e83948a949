//! # Cluster Net
//!
//! Networking core for a cluster of game server nodes: message registry and
//! codec, session handling, request/response correlation and the listeners
//! that tie them together.
//!
//! ## Core Features
//!
//! - **Message Registry**: Types are bound to caller-supplied identities and
//!   routed to handlers or routers by identity
//! - **Pluggable Wire Strategy**: An [`RpcHandler`] can replace the default
//!   JSON envelope codec wholesale
//! - **Ticket Correlation**: [`AsyncResultMgr`] pairs outgoing requests with
//!   their replies, either awaited or delivered through a callback
//! - **Sessions**: Each connection runs an [`Agent`] with its own ticket table
//!   and user data
//! - **Supervision**: [`Server`] starts WebSocket (plain or TLS) and TCP listeners plus an
//!   optional uplink to the master node, and stops them in reverse order
//!
//! ## Quick Start Example
//!
//! ```rust,no_run
//! use cluster_net::{Processor, Server, ServerConfig};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping {
//!     seq: u32,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let processor = Arc::new(Processor::new());
//!     processor.register::<Ping>("Ping")?;
//!     processor.set_handler::<Ping, _>("Ping", |ping, session| {
//!         session.write_message(&Ping { seq: ping.seq + 1 });
//!     })?;
//!
//!     let config = ServerConfig {
//!         tcp_addr: "127.0.0.1:3563".to_string(),
//!         ..ServerConfig::default()
//!     };
//!     Server::new(config, processor)
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod async_result;
pub mod config;
pub mod conn;
pub mod error;
pub mod message;
pub mod net;
pub mod processor;
pub mod router;
pub mod rpc;
pub mod server;
pub mod session;

pub use agent::{Agent, ConnectHook, DisconnectHook, HookError};
pub use async_result::{
    AsyncResult, AsyncResultMgr, Callback, ResultMode, Ticket, TicketCallback, TicketPayload, TICKET_MAX,
    TICKET_MIN,
};
pub use config::{ByteOrder, ServerConfig, ServerRole};
pub use conn::{Conn, MemoryConn, MsgParser, TcpConn, WsConn};
pub use error::{CodecError, CorrelationError, RegistryError, RouteError, ServerError, TransportError};
pub use message::{Decoded, Message, MessageBody, MessageId, RawMessage, TypedMessage};
pub use net::{load_tls_acceptor, NewAgent, TcpClient, TcpServer, WsServer};
pub use processor::{MessageHandler, Processor, RawHandler};
pub use router::{Router, RouterCall, RouterWorker};
pub use rpc::{IdFrameHandler, RpcHandler};
pub use server::{RunningServer, Server, ServerHooks};
pub use session::{Session, SessionRef, UserData};

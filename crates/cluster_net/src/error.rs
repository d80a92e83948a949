//! Error types for the message routing and correlation layer.
//!
//! Errors are split by concern so callers can tell a setup mistake from a
//! misbehaving peer:
//!
//! * [`RegistryError`] - configuration mistakes made while registering messages
//! * [`CodecError`] - envelope or payload encoding/decoding failures
//! * [`RouteError`] - a decoded message had nowhere to go
//! * [`CorrelationError`] - ticket lookups, timeouts and misuse of the ticket table
//! * [`TransportError`] - connection level read/write failures
//! * [`ServerError`] - supervisor startup failures

use crate::async_result::Ticket;
use crate::message::MessageId;

/// Configuration errors raised while the registry is being built.
///
/// These are meant to stop the process before it serves any traffic.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The identity supplied at registration was empty
    #[error("message identity must not be empty")]
    EmptyIdentity,
    /// The identity is already bound to a type
    #[error("message {0} is already registered")]
    AlreadyRegistered(MessageId),
    /// The Rust type is already bound to another identity
    #[error("type {type_name} is already registered as {existing}")]
    TypeAlreadyRegistered {
        type_name: &'static str,
        existing: MessageId,
    },
    /// Attaching behavior to an identity that was never registered
    #[error("message {0} not registered")]
    NotRegistered(MessageId),
    /// A handler was attached with a type other than the registered one
    #[error("message {id} is registered as {registered}, not {requested}")]
    TypeMismatch {
        id: MessageId,
        registered: &'static str,
        requested: &'static str,
    },
    /// A numeric frame code was bound twice
    #[error("frame code {code} is already bound to {existing}")]
    CodeAlreadyBound { code: u16, existing: MessageId },
    /// Setup attempted after traffic started
    #[error("registry is sealed, cannot {0}")]
    Sealed(String),
}

/// Encoding and decoding failures for envelopes and payloads.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope could not be parsed at all
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    /// The envelope did not carry exactly one message
    #[error("envelope must carry exactly one message, found {0}")]
    InvalidArity(usize),
    /// The envelope names an identity this registry does not know
    #[error("message {0} not registered")]
    UnknownMessage(MessageId),
    /// The value handed to marshal is not of a registered type
    #[error("value is not a registered message type")]
    UnregisteredType,
    /// A typed message carries a body of another type than its identity's
    #[error("message {0} body does not match its registered type")]
    TypeMismatch(MessageId),
    /// A numeric frame names a code with no bound identity
    #[error("frame code {0} is not bound")]
    UnknownCode(u16),
    /// The identity has no numeric frame code bound
    #[error("message {0} has no frame code")]
    UnboundMessage(MessageId),
    /// The payload codec rejected the body
    #[error("message {id} payload codec failed: {source}")]
    Payload {
        id: MessageId,
        #[source]
        source: bincode::Error,
    },
}

/// Dispatch failures for an already decoded message.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Nothing is registered under the identity
    #[error("message {0} not registered")]
    UnknownMessage(MessageId),
    /// The identity is registered but has no handler, router or raw handler
    #[error("message {0} has no handler")]
    NoHandler(MessageId),
    /// The decoded body is not of the type registered under its identity
    #[error("message {0} body does not match its registered type")]
    TypeMismatch(MessageId),
    /// Re-encoding a typed message for a raw handler failed
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Failures of the ticket based correlation table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    /// A blocking result cannot also carry a continuation
    #[error("blocking result can't set a callback")]
    BlockingWithCallback,
    /// A non-blocking result needs a continuation
    #[error("non-blocking result needs a callback")]
    MissingCallback,
    /// Every ticket in the numeric range is currently live
    #[error("no free ticket available")]
    Exhausted,
    /// The ticket was already resolved, timed out, or never issued
    #[error("async result {0} not found")]
    NotFound(Ticket),
    /// The blocking wait gave up
    #[error("async result {0} timed out")]
    Timeout(Ticket),
    /// The table was dropped or cleared while the waiter was blocked
    #[error("async result {0} was cancelled")]
    Cancelled(Ticket),
    /// `get_result` was called on a callback-mode result
    #[error("async result {0} is not a blocking result")]
    NotBlocking(Ticket),
}

/// Connection level failures. Always terminal for the session that hit them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error("message too long: {len} > {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error("message too short: {len} < {min}")]
    MessageTooShort { len: usize, min: usize },
    #[error("pending write queue full")]
    WriteQueueFull,
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Supervisor level failures.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding or configuring a listener failed
    #[error("Network error: {0}")]
    Network(String),
    /// The server configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),
    /// The certificate or key for the encrypted listener could not be loaded
    #[error("TLS error: {0}")]
    Tls(String),
    /// The processor could not be prepared
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

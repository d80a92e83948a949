//! The session abstraction handed to message handlers.
//!
//! Handlers never see the concrete [`Agent`](crate::Agent); they receive a
//! [`SessionRef`] so tests and alternative transports can supply their own.

use crate::async_result::{Ticket, TicketCallback, TicketPayload};
use crate::error::CorrelationError;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

/// Opaque application data attached to a session.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Shared handle to a live session.
pub type SessionRef = Arc<dyn Session>;

/// One peer as seen by application code.
pub trait Session: Send + Sync {
    /// Marshals and queues a registered message. Failures are logged, not returned.
    fn write_message(&self, msg: &dyn Any);

    fn local_addr(&self) -> SocketAddr;

    fn remote_addr(&self) -> SocketAddr;

    /// Stops further I/O, flushing queued writes first.
    fn close(&self);

    /// Releases the connection immediately, dropping queued writes.
    fn destroy(&self);

    fn user_data(&self) -> Option<UserData>;

    fn set_user_data(&self, data: UserData);

    /// Registers a session-scoped continuation and returns its ticket.
    ///
    /// Returns `None` when the ticket table has no free slot.
    fn get_ticket(&self, callback: TicketCallback) -> Option<Ticket>;

    /// Resolves a ticket issued by this session.
    fn exec_ticket(&self, ticket: Ticket, payload: TicketPayload) -> Result<(), CorrelationError>;
}

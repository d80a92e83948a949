//! Fan-out routing of decoded messages to a worker task.
//!
//! A [`Router`] is the sending half attached to a registered identity with
//! [`Processor::set_router`](crate::Processor::set_router). Routed messages are
//! queued, never handled inline, and a [`RouterWorker`] drains the queue on its
//! own task, invoking the callback registered for the decoded body's type.
//!
//! # Backpressure
//!
//! `Router::go` is called from session read loops and must not block them. When
//! the queue is full the call is dropped and a warning is logged.

use crate::message::TypedMessage;
use crate::session::SessionRef;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

/// One queued call: the decoded message and the session it arrived on.
#[derive(Clone)]
pub struct RouterCall {
    pub message: TypedMessage,
    pub session: SessionRef,
}

type RouterCallback = Box<dyn Fn(&TypedMessage, &SessionRef) + Send + Sync>;

/// Sending half of a fan-out router. Cheap to clone.
#[derive(Clone)]
pub struct Router {
    name: Arc<str>,
    sender: mpsc::Sender<RouterCall>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("capacity", &self.sender.max_capacity())
            .finish()
    }
}

impl Router {
    /// Creates a router and the worker that drains it.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in log output
    /// * `capacity` - Number of calls buffered before `go` starts dropping
    pub fn channel(name: impl Into<Arc<str>>, capacity: usize) -> (Router, RouterWorker) {
        let name = name.into();
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let router = Router {
            name: name.clone(),
            sender,
        };
        let worker = RouterWorker {
            name,
            receiver,
            callbacks: HashMap::new(),
        };
        (router, worker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a call without blocking. Returns `false` if it was dropped.
    pub fn go(&self, message: TypedMessage, session: SessionRef) -> bool {
        match self.sender.try_send(RouterCall { message, session }) {
            Ok(()) => true,
            Err(TrySendError::Full(call)) => {
                warn!(
                    "router {} queue full, dropping message {}",
                    self.name,
                    call.message.id()
                );
                false
            }
            Err(TrySendError::Closed(call)) => {
                warn!(
                    "router {} worker stopped, dropping message {}",
                    self.name,
                    call.message.id()
                );
                false
            }
        }
    }
}

/// Receiving half of a fan-out router.
pub struct RouterWorker {
    name: Arc<str>,
    receiver: mpsc::Receiver<RouterCall>,
    callbacks: HashMap<TypeId, RouterCallback>,
}

impl RouterWorker {
    /// Registers the callback run for messages whose body is a `T`.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register<T, F>(&mut self, callback: F) -> &mut Self
    where
        T: 'static,
        F: Fn(&T, &SessionRef) + Send + Sync + 'static,
    {
        let wrapped: RouterCallback = Box::new(move |message: &TypedMessage, session: &SessionRef| {
            if let Some(value) = message.downcast_ref::<T>() {
                callback(value, session);
            }
        });
        self.callbacks.insert(TypeId::of::<T>(), wrapped);
        self
    }

    /// Runs the callback for one call. Returns whether a callback was found.
    pub fn exec(&self, call: &RouterCall) -> bool {
        match self.callbacks.get(&call.message.body_type_id()) {
            Some(callback) => {
                callback(&call.message, &call.session);
                true
            }
            None => {
                error!(
                    "router {}: no callback registered for message {}",
                    self.name,
                    call.message.id()
                );
                false
            }
        }
    }

    /// Drains calls until every [`Router`] clone has been dropped.
    pub async fn run(mut self) {
        while let Some(call) = self.receiver.recv().await {
            self.exec(&call);
        }
        debug!("router {} worker finished", self.name);
    }

    /// Handles every call already queued without waiting for more.
    pub fn drain_pending(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(call) = self.receiver.try_recv() {
            self.exec(&call);
            handled += 1;
        }
        handled
    }
}

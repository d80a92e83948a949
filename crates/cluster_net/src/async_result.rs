//! Ticket based request/response correlation.
//!
//! A requester asks the [`AsyncResultMgr`] for a ticket, sends the ticket
//! along with its request, and later the peer's reply resolves that ticket
//! through [`AsyncResultMgr::fill_async_result`]. Replies may arrive in any
//! order. Two resolution modes exist:
//!
//! * **Blocking** - the caller awaits [`AsyncResult::get_result`] with a timeout
//! * **Callback** - a continuation runs when the ticket is filled
//!
//! Each entry is resolved at most once: filling removes it from the table
//! before the waiter is released or the continuation runs, and a timed-out
//! wait removes its own entry so a late reply cannot hit a reused ticket.

use crate::error::CorrelationError;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Numeric key identifying one in-flight correlation.
pub type Ticket = u32;

/// Lowest ticket ever issued. `0` is reserved for "no ticket".
pub const TICKET_MIN: Ticket = 1;

/// Highest ticket issued before the counter wraps back to [`TICKET_MIN`].
pub const TICKET_MAX: Ticket = u16::MAX as Ticket;

const TICKET_SPAN: usize = (TICKET_MAX - TICKET_MIN + 1) as usize;

/// Payload type used by session-scoped ticket tables.
pub type TicketPayload = Arc<dyn Any + Send + Sync>;

/// Continuation invoked when a callback-mode ticket is filled.
pub type Callback<T> = Box<dyn FnOnce(T) + Send + Sync + 'static>;

/// Continuation type for session-scoped tickets.
pub type TicketCallback = Callback<TicketPayload>;

/// How a pending entry is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultMode {
    Blocking,
    Callback,
}

enum Pending<T> {
    Blocking(oneshot::Sender<T>),
    Callback(Callback<T>),
}

impl<T> Pending<T> {
    fn mode(&self) -> ResultMode {
        match self {
            Pending::Blocking(_) => ResultMode::Blocking,
            Pending::Callback(_) => ResultMode::Callback,
        }
    }
}

struct ResultTable<T> {
    ticker: Ticket,
    results: HashMap<Ticket, Pending<T>>,
}

impl<T> ResultTable<T> {
    fn new() -> Self {
        Self {
            ticker: 0,
            results: HashMap::new(),
        }
    }

    fn next_ticket(&mut self) -> Result<Ticket, CorrelationError> {
        if self.results.len() >= TICKET_SPAN {
            return Err(CorrelationError::Exhausted);
        }
        loop {
            self.ticker = if self.ticker >= TICKET_MAX {
                TICKET_MIN
            } else {
                self.ticker + 1
            };
            if !self.results.contains_key(&self.ticker) {
                return Ok(self.ticker);
            }
        }
    }

    fn insert(&mut self, pending: Pending<T>) -> Result<Ticket, CorrelationError> {
        let ticket = self.next_ticket()?;
        self.results.insert(ticket, pending);
        Ok(ticket)
    }
}

/// One pending correlation handed back by [`AsyncResultMgr::add`].
pub struct AsyncResult<T> {
    ticket: Ticket,
    mode: ResultMode,
    receiver: Option<oneshot::Receiver<T>>,
    table: Weak<RwLock<ResultTable<T>>>,
}

impl<T> AsyncResult<T> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    pub fn mode(&self) -> ResultMode {
        self.mode
    }

    /// Waits for the ticket to be filled, giving up after `timeout`.
    ///
    /// On timeout the entry is removed from the table under the same lock
    /// `fill_async_result` takes, so exactly one of the two wins. If the
    /// returned future is dropped mid-wait the entry is removed as well.
    pub async fn get_result(mut self, timeout: Duration) -> Result<T, CorrelationError> {
        let ticket = self.ticket;
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(CorrelationError::NotBlocking(ticket));
        };

        let outcome = tokio::time::timeout(timeout, receiver).await;
        match outcome {
            Ok(Ok(payload)) => {
                self.receiver = None;
                Ok(payload)
            }
            Ok(Err(_)) => {
                self.receiver = None;
                Err(CorrelationError::Cancelled(ticket))
            }
            Err(_) => {
                // The fill won the race and already sent its payload.
                if let Some(payload) = self.abandon() {
                    return Ok(payload);
                }
                warn!("GetResult AsyncResult: timeout {}", ticket);
                Err(CorrelationError::Timeout(ticket))
            }
        }
    }

    /// Gives up on the wait, removing the entry if it is still pending.
    ///
    /// The sender lives in the table until the entry is filled or removed,
    /// so an empty channel under the table lock means the entry is ours. A
    /// ticket that was already filled may have been reissued and is left
    /// alone.
    fn abandon(&mut self) -> Option<T> {
        let mut receiver = self.receiver.take()?;
        let table = self.table.upgrade();
        let mut guard = table.as_ref().map(|table| table.write());
        match receiver.try_recv() {
            Ok(payload) => Some(payload),
            Err(oneshot::error::TryRecvError::Empty) => {
                if let Some(guard) = guard.as_mut() {
                    guard.results.remove(&self.ticket);
                }
                None
            }
            Err(oneshot::error::TryRecvError::Closed) => None,
        }
    }
}

impl<T> Drop for AsyncResult<T> {
    fn drop(&mut self) {
        // Covers un-awaited results and waits cancelled from outside.
        self.abandon();
    }
}

impl<T> std::fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult")
            .field("ticket", &self.ticket)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Ticket-issuing correlation table.
///
/// Cloning is cheap and yields a handle to the same table.
pub struct AsyncResultMgr<T> {
    table: Arc<RwLock<ResultTable<T>>>,
}

impl<T> Clone for AsyncResultMgr<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<T> Default for AsyncResultMgr<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AsyncResultMgr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.read();
        f.debug_struct("AsyncResultMgr")
            .field("ticker", &table.ticker)
            .field("pending", &table.results.len())
            .finish()
    }
}

impl<T> AsyncResultMgr<T> {
    pub fn new() -> Self {
        Self {
            table: Arc::new(RwLock::new(ResultTable::new())),
        }
    }

    /// Allocates the next ticket.
    ///
    /// `blocking` and `continuation` are mutually exclusive: a blocking result
    /// is awaited through [`AsyncResult::get_result`], a non-blocking one must
    /// supply the continuation to run when it is filled.
    pub fn add(
        &self,
        blocking: bool,
        continuation: Option<Callback<T>>,
    ) -> Result<AsyncResult<T>, CorrelationError> {
        match (blocking, continuation) {
            (true, Some(_)) => Err(CorrelationError::BlockingWithCallback),
            (false, None) => Err(CorrelationError::MissingCallback),
            (true, None) => {
                let (sender, receiver) = oneshot::channel();
                let ticket = self.table.write().insert(Pending::Blocking(sender))?;
                Ok(AsyncResult {
                    ticket,
                    mode: ResultMode::Blocking,
                    receiver: Some(receiver),
                    table: Arc::downgrade(&self.table),
                })
            }
            (false, Some(callback)) => {
                let ticket = self.table.write().insert(Pending::Callback(callback))?;
                Ok(AsyncResult {
                    ticket,
                    mode: ResultMode::Callback,
                    receiver: None,
                    table: Arc::downgrade(&self.table),
                })
            }
        }
    }

    pub fn add_blocking(&self) -> Result<AsyncResult<T>, CorrelationError> {
        self.add(true, None)
    }

    pub fn add_callback<F>(&self, callback: F) -> Result<AsyncResult<T>, CorrelationError>
    where
        F: FnOnce(T) + Send + Sync + 'static,
    {
        self.add(false, Some(Box::new(callback)))
    }

    /// Drops the entry for `ticket`. Returns whether it was still pending.
    pub fn remove(&self, ticket: Ticket) -> bool {
        let removed = self.table.write().results.remove(&ticket);
        removed.is_some()
    }

    /// Looks up a pending ticket without resolving it.
    pub fn get_async_result(&self, ticket: Ticket) -> Result<ResultMode, CorrelationError> {
        self.table
            .read()
            .results
            .get(&ticket)
            .map(Pending::mode)
            .ok_or(CorrelationError::NotFound(ticket))
    }

    /// Resolves `ticket` with `payload`.
    ///
    /// The entry is removed before the blocked waiter is released or the
    /// continuation runs. Continuations run outside the table lock.
    pub fn fill_async_result(&self, ticket: Ticket, payload: T) -> Result<(), CorrelationError> {
        let mut table = self.table.write();
        let pending = table
            .results
            .remove(&ticket)
            .ok_or(CorrelationError::NotFound(ticket))?;

        match pending {
            // Sent under the lock so a timing-out waiter sees either the
            // entry or the payload.
            Pending::Blocking(sender) => {
                if sender.send(payload).is_err() {
                    debug!("async result {} filled after its waiter left", ticket);
                }
            }
            Pending::Callback(callback) => {
                drop(table);
                callback(payload);
            }
        }
        Ok(())
    }

    /// Drops every pending entry. Blocked waiters observe a cancellation.
    pub fn clear(&self) -> usize {
        let drained = std::mem::take(&mut self.table.write().results);
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.table.read().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[test]
    fn test_add_mode_exclusion() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();

        let both = mgr.add(true, Some(Box::new(|_: u32| {})));
        assert_eq!(both.unwrap_err(), CorrelationError::BlockingWithCallback);

        let neither = mgr.add(false, None);
        assert_eq!(neither.unwrap_err(), CorrelationError::MissingCallback);

        let blocking = mgr.add(true, None).expect("blocking add should succeed");
        assert_eq!(blocking.mode(), ResultMode::Blocking);

        let callback = mgr
            .add(false, Some(Box::new(|_: u32| {})))
            .expect("callback add should succeed");
        assert_eq!(callback.mode(), ResultMode::Callback);
        assert_ne!(blocking.ticket(), callback.ticket());
    }

    #[test]
    fn test_first_ticket_is_one() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(result.ticket(), TICKET_MIN);
    }

    #[test]
    fn test_fill_is_at_most_once() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = mgr
            .add_callback(move |value| {
                assert_eq!(value, 7);
                calls_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        let ticket = result.ticket();

        assert!(mgr.fill_async_result(ticket, 7).is_ok());
        assert_eq!(
            mgr.fill_async_result(ticket, 8),
            Err(CorrelationError::NotFound(ticket))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_callback_can_reenter_table() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let inner = mgr.clone();
        let result = mgr
            .add_callback(move |_| {
                // Entry is already gone and the lock is released.
                assert!(inner.is_empty());
                inner.add_callback(|_| {}).unwrap();
            })
            .unwrap();

        mgr.fill_async_result(result.ticket(), 1).unwrap();
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn test_get_async_result_lookup() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_callback(|_| {}).unwrap();

        assert_eq!(
            mgr.get_async_result(result.ticket()),
            Ok(ResultMode::Callback)
        );
        assert!(mgr.remove(result.ticket()));
        assert_eq!(
            mgr.get_async_result(result.ticket()),
            Err(CorrelationError::NotFound(result.ticket()))
        );
    }

    #[test]
    fn test_wraparound_skips_live_tickets() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let live = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(live.ticket(), 1);

        mgr.table.write().ticker = TICKET_MAX - 1;

        let last = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(last.ticket(), TICKET_MAX);

        // 1 is still live, so the wrapped counter lands on 2.
        let wrapped = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(wrapped.ticket(), 2);
    }

    #[test]
    fn test_exhausted_table() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        for _ in 0..TICKET_SPAN {
            mgr.add_callback(|_| {}).unwrap();
        }
        assert_eq!(
            mgr.add_callback(|_| {}).unwrap_err(),
            CorrelationError::Exhausted
        );

        mgr.remove(100);
        let reused = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(reused.ticket(), 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_adds_are_unique() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let mut handles = Vec::new();

        for _ in 0..8 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move {
                let mut tickets = Vec::new();
                for _ in 0..500 {
                    let result = mgr.add_callback(|_| {}).unwrap();
                    tickets.push(result.ticket());
                }
                tickets
            }));
        }

        let mut all = HashSet::new();
        for handle in handles {
            for ticket in handle.await.unwrap() {
                assert!(all.insert(ticket), "ticket {ticket} issued twice");
            }
        }
        assert_eq!(all.len(), 4000);
        assert_eq!(mgr.len(), 4000);
    }

    #[tokio::test]
    async fn test_blocking_result_is_released() {
        let mgr: AsyncResultMgr<String> = AsyncResultMgr::new();
        let result = mgr.add_blocking().unwrap();
        let ticket = result.ticket();

        let filler = mgr.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            filler.fill_async_result(ticket, "pong".to_string()).unwrap();
        });

        let payload = result.get_result(Duration::from_secs(1)).await.unwrap();
        assert_eq!(payload, "pong");
        assert!(mgr.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_isolates_waiters() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let stale = mgr.add_blocking().unwrap();
        let other = mgr.add_blocking().unwrap();
        let stale_ticket = stale.ticket();
        let other_ticket = other.ticket();

        let other_wait = tokio::spawn(other.get_result(Duration::from_secs(2)));

        let started = Instant::now();
        let err = stale.get_result(Duration::from_millis(50)).await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, CorrelationError::Timeout(stale_ticket));
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_millis(500));

        // The stale ticket can no longer be resolved.
        assert_eq!(
            mgr.fill_async_result(stale_ticket, 1),
            Err(CorrelationError::NotFound(stale_ticket))
        );

        // The other waiter is unaffected.
        mgr.fill_async_result(other_ticket, 42).unwrap();
        assert_eq!(other_wait.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_clear_cancels_waiters() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_blocking().unwrap();
        let ticket = result.ticket();
        mgr.add_callback(|_| panic!("cleared callbacks must not run"))
            .unwrap();

        assert_eq!(mgr.clear(), 2);
        assert_eq!(
            result.get_result(Duration::from_secs(1)).await,
            Err(CorrelationError::Cancelled(ticket))
        );
    }

    #[tokio::test]
    async fn test_get_result_on_callback_mode() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_callback(|_| {}).unwrap();
        let ticket = result.ticket();
        assert_eq!(
            result.get_result(Duration::from_millis(10)).await,
            Err(CorrelationError::NotBlocking(ticket))
        );
        // Dropping the handle of a callback result keeps the entry.
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_wait_releases_ticket() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_blocking().unwrap();
        let ticket = result.ticket();

        let outer = tokio::time::timeout(
            Duration::from_millis(20),
            result.get_result(Duration::from_secs(60)),
        )
        .await;
        assert!(outer.is_err());

        assert!(mgr.is_empty());
        assert_eq!(
            mgr.fill_async_result(ticket, 1),
            Err(CorrelationError::NotFound(ticket))
        );
    }

    #[tokio::test]
    async fn test_cancelled_select_branch_releases_ticket() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_blocking().unwrap();

        tokio::select! {
            _ = result.get_result(Duration::from_secs(60)) => panic!("nothing filled the ticket"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_dropping_filled_result_keeps_reissued_ticket() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let filled = mgr.add_blocking().unwrap();
        let ticket = filled.ticket();
        mgr.fill_async_result(ticket, 5).unwrap();

        // Force the counter back so the same ticket is handed out again.
        mgr.table.write().ticker = ticket - 1;
        let reissued = mgr.add_callback(|_| {}).unwrap();
        assert_eq!(reissued.ticket(), ticket);

        drop(filled);
        assert_eq!(mgr.get_async_result(ticket), Ok(ResultMode::Callback));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fill_racing_timeout_never_loses_payload() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        for round in 0..200u32 {
            let result = mgr.add_blocking().unwrap();
            let ticket = result.ticket();

            let filler = mgr.clone();
            let fill = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                filler.fill_async_result(ticket, round)
            });
            let waited = result.get_result(Duration::from_millis(1)).await;
            let filled = fill.await.unwrap();

            // Either the fill delivered and the waiter got it, or the
            // timeout removed the entry first.
            match waited {
                Ok(value) => {
                    assert_eq!(value, round);
                    assert!(filled.is_ok());
                }
                Err(e) => {
                    assert_eq!(e, CorrelationError::Timeout(ticket));
                    assert_eq!(filled, Err(CorrelationError::NotFound(ticket)));
                }
            }
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_dropped_blocking_result_releases_ticket() {
        let mgr: AsyncResultMgr<u32> = AsyncResultMgr::new();
        let result = mgr.add_blocking().unwrap();
        let ticket = result.ticket();
        drop(result);
        assert_eq!(
            mgr.get_async_result(ticket),
            Err(CorrelationError::NotFound(ticket))
        );
    }
}

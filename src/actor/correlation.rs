//! Correlation table for in-flight requests.
//!
//! This module provides the CorrelationTable which tracks pending requests
//! and routes incoming responses to their waiters via oneshot channels.
//!
//! # Flow
//!
//! - Before a request is queued, `register(id, deadline)` creates the slot
//!   and hands back a [`ResponseFuture`]
//! - The reader task calls `resolve(id, response)` when a frame arrives
//! - The caller awaits the future without holding any lock
//! - On connection loss the supervisor calls `fail_all`
//!
//! Dropping a `ResponseFuture` before it completes removes its entry, so a
//! late response for it is treated as an orphan.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::Sleep;

use crate::error::{ClientError, LockResultExt, Result};
use crate::protocol::{MessageId, Response};

type Slot = oneshot::Sender<Result<Response>>;

/// A registered request waiting for its response.
struct PendingResult {
    slot: Slot,
    submitted_at: Instant,
}

/// Thread-safe map from message id to a single-assignment result slot.
///
/// Many callers register concurrently; one reader task resolves.
pub(crate) struct CorrelationTable {
    pending: Mutex<HashMap<MessageId, PendingResult>>,
}

impl CorrelationTable {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Register a pending request and return the future for its response.
    ///
    /// Must be called before the request is written so a fast response can
    /// always be routed. Returns `None` if `id` is already pending.
    pub(crate) fn register(
        self: &Arc<Self>,
        id: MessageId,
        deadline: Option<Duration>,
    ) -> Option<ResponseFuture> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().recover_poison("CorrelationTable::register");
            if pending.contains_key(&id) {
                return None;
            }
            pending.insert(
                id.clone(),
                PendingResult {
                    slot: tx,
                    submitted_at: Instant::now(),
                },
            );
        }

        Some(ResponseFuture {
            id,
            rx,
            deadline: deadline.map(|d| tokio::time::Instant::now() + d),
            timer: None,
            table: Arc::downgrade(self),
            finished: false,
        })
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `true` if a waiter received it, `false` for unknown ids.
    pub(crate) fn resolve(&self, id: &MessageId, response: Response) -> bool {
        let entry = self
            .pending
            .lock()
            .recover_poison("CorrelationTable::resolve")
            .remove(id);

        match entry {
            Some(entry) => {
                log::trace!(
                    target: "subline::correlation",
                    "Resolved {} after {:?}",
                    id,
                    entry.submitted_at.elapsed()
                );
                entry.slot.send(Ok(response)).is_ok()
            }
            None => false,
        }
    }

    /// Fail a single pending request.
    pub(crate) fn fail(&self, id: &MessageId, error: ClientError) -> bool {
        let entry = self
            .pending
            .lock()
            .recover_poison("CorrelationTable::fail")
            .remove(id);

        match entry {
            Some(entry) => entry.slot.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Remove a pending request without completing it.
    pub(crate) fn remove(&self, id: &MessageId) -> bool {
        self.pending
            .lock()
            .recover_poison("CorrelationTable::remove")
            .remove(id)
            .is_some()
    }

    /// Fail every outstanding request with `error` and empty the table.
    ///
    /// Returns how many requests were failed.
    pub(crate) fn fail_all(&self, error: ClientError) -> usize {
        let entries: Vec<_> = self
            .pending
            .lock()
            .recover_poison("CorrelationTable::fail_all")
            .drain()
            .collect();

        // Lock is released before completing the waiters
        let count = entries.len();
        for (_, entry) in entries {
            let _ = entry.slot.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .recover_poison("CorrelationTable::pending_count")
            .len()
    }
}

/// Future resolving to the response of one submitted request.
///
/// Completes exactly once with the response, [`ClientError::Timeout`] when
/// its deadline passes, or the error the request was failed with
/// ([`ClientError::TransportLost`], [`ClientError::Cancelled`]). Dropping
/// it, or calling [`ResponseFuture::cancel`], abandons the request locally;
/// nothing is sent to the controller.
#[must_use = "dropping a ResponseFuture cancels the request"]
pub struct ResponseFuture {
    id: MessageId,
    rx: oneshot::Receiver<Result<Response>>,
    deadline: Option<tokio::time::Instant>,
    /// Created on first poll so registering needs no runtime context.
    timer: Option<Pin<Box<Sleep>>>,
    table: Weak<CorrelationTable>,
    finished: bool,
}

impl ResponseFuture {
    pub fn message_id(&self) -> &MessageId {
        &self.id
    }

    /// Stop waiting for the response.
    ///
    /// Returns `true` if the request was still pending.
    pub fn cancel(mut self) -> bool {
        self.finished = true;
        self.detach()
    }

    fn detach(&self) -> bool {
        self.table
            .upgrade()
            .map(|table| table.remove(&self.id))
            .unwrap_or(false)
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(Err(ClientError::cancelled("response already taken")));
        }

        if let Poll::Ready(result) = Pin::new(&mut this.rx).poll(cx) {
            this.finished = true;
            return Poll::Ready(
                result.unwrap_or_else(|_| Err(ClientError::transport_lost("response slot dropped"))),
            );
        }

        let Some(deadline) = this.deadline else {
            return Poll::Pending;
        };
        let timer = this
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if timer.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        this.finished = true;
        if !this.detach() {
            // Completed between the two polls; the result wins over the timeout
            if let Ok(result) = this.rx.try_recv() {
                return Poll::Ready(result);
            }
        }
        log::debug!(
            target: "subline::correlation",
            "Request {} timed out",
            this.id
        );
        Poll::Ready(Err(ClientError::Timeout))
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.finished && self.detach() {
            log::debug!(
                target: "subline::correlation",
                "Request {} abandoned before its response arrived",
                self.id
            );
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_test::{assert_pending, assert_ready};

    fn response(id: &str) -> Response {
        serde_json::from_value(json!({
            "messageID": id,
            "command": "SendQuery",
            "response": "200"
        }))
        .unwrap()
    }

    #[test]
    fn new_table_is_empty() {
        assert_eq!(CorrelationTable::new().pending_count(), 0);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let table = CorrelationTable::new();
        let _first = table.register(MessageId::from("1"), None).unwrap();
        assert!(table.register(MessageId::from("1"), None).is_none());
        assert_eq!(table.pending_count(), 1);
    }

    #[tokio::test]
    async fn resolve_delivers_response_once() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("1"), None).unwrap();

        assert!(table.resolve(&MessageId::from("1"), response("1")));
        assert!(!table.resolve(&MessageId::from("1"), response("1")), "second resolve is a no-op");
        assert_eq!(table.pending_count(), 0);

        let received = future.await.unwrap();
        assert_eq!(received.message_id(), Some(&MessageId::from("1")));
    }

    #[test]
    fn resolve_unknown_id_returns_false() {
        let table = CorrelationTable::new();
        assert!(!table.resolve(&MessageId::from("nope"), response("nope")));
    }

    #[tokio::test]
    async fn fail_all_fails_every_waiter_and_empties_table() {
        let table = CorrelationTable::new();
        let a = table.register(MessageId::from("a"), None).unwrap();
        let b = table.register(MessageId::from("b"), None).unwrap();

        assert_eq!(table.fail_all(ClientError::transport_lost("reset")), 2);
        assert_eq!(table.pending_count(), 0);
        assert!(matches!(a.await, Err(ClientError::TransportLost(_))));
        assert!(matches!(b.await, Err(ClientError::TransportLost(_))));

        // Nothing left to fail
        assert_eq!(table.fail_all(ClientError::transport_lost("again")), 0);
    }

    #[tokio::test]
    async fn fail_all_leaves_resolved_entries_alone() {
        let table = CorrelationTable::new();
        let resolved = table.register(MessageId::from("r"), None).unwrap();
        let outstanding = table.register(MessageId::from("o"), None).unwrap();
        table.resolve(&MessageId::from("r"), response("r"));

        assert_eq!(table.fail_all(ClientError::transport_lost("reset")), 1);
        assert!(resolved.await.is_ok());
        assert!(outstanding.await.is_err());
    }

    #[tokio::test]
    async fn fail_single_request() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("w"), None).unwrap();
        assert!(table.fail(&MessageId::from("w"), ClientError::transport_lost("write error")));
        assert!(matches!(future.await, Err(ClientError::TransportLost(msg)) if msg == "write error"));
    }

    #[test]
    fn dropping_future_removes_entry() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("1"), None).unwrap();
        drop(future);
        assert_eq!(table.pending_count(), 0);
        assert!(!table.resolve(&MessageId::from("1"), response("1")));
    }

    #[test]
    fn cancel_reports_whether_request_was_pending() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("1"), None).unwrap();
        assert!(future.cancel());
        assert_eq!(table.pending_count(), 0);

        let future = table.register(MessageId::from("2"), None).unwrap();
        table.resolve(&MessageId::from("2"), response("2"));
        assert!(!future.cancel());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expiry_times_out_and_removes_entry() {
        let table = CorrelationTable::new();
        let mut future =
            tokio_test::task::spawn(table.register(MessageId::from("t"), Some(Duration::from_secs(5))).unwrap());

        assert_pending!(future.poll());
        tokio::time::advance(Duration::from_secs(6)).await;

        let result = assert_ready!(future.poll());
        assert!(matches!(result, Err(ClientError::Timeout)));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn response_before_deadline_wins() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("t"), Some(Duration::from_secs(5))).unwrap();
        table.resolve(&MessageId::from("t"), response("t"));
        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(future.await.is_ok());
    }

    #[tokio::test]
    async fn table_dropped_reports_transport_lost() {
        let table = CorrelationTable::new();
        let future = table.register(MessageId::from("x"), None).unwrap();
        drop(table);
        assert!(matches!(future.await, Err(ClientError::TransportLost(_))));
    }
}

//! Reader task for the controller socket.
//!
//! This module provides the background task that reads frames from the
//! controller and routes them:
//! - Responses carrying a pending message id complete that request
//! - `NotifyList` frames fan out to topic listeners via the dispatcher
//! - Malformed frames and orphan responses are logged and skipped
//!
//! EOF and read errors end the task and are reported to the supervisor.

use std::io;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use log::{debug, trace, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CorrelationTable, FailureNotifier};
use crate::protocol::{Frame, Response};
use crate::subscription::{Delivery, DeliveryQueue, SubscriptionRegistry};

/// Handle to a running reader task.
///
/// Dropping it cancels the task.
pub(crate) struct ReaderTaskHandle {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl ReaderTaskHandle {
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub(crate) async fn shutdown(mut self) {
        self.cancel_token.cancel();
        // Reads are cancel-safe, so the next select observes the token
        let _ = (&mut self.join_handle).await;
    }
}

impl Drop for ReaderTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.join_handle.abort();
    }
}

/// Where incoming frames go.
pub(crate) struct FrameRouter {
    table: Arc<CorrelationTable>,
    registry: Arc<SubscriptionRegistry>,
    deliveries: DeliveryQueue,
}

impl FrameRouter {
    pub(crate) fn new(
        table: Arc<CorrelationTable>,
        registry: Arc<SubscriptionRegistry>,
        deliveries: DeliveryQueue,
    ) -> Self {
        Self {
            table,
            registry,
            deliveries,
        }
    }

    fn handle_frame(&self, frame: Frame) {
        let response = match frame {
            Frame::Response(response) => response,
            Frame::Malformed { line, reason } => {
                warn!(
                    target: "subline::reader",
                    "Skipping malformed frame ({}): {}",
                    reason,
                    line
                );
                return;
            }
        };

        let notification = response.is_notification();
        if notification {
            self.notify(&response);
        }

        let Some(id) = response.message_id().cloned() else {
            if !notification {
                warn!(
                    target: "subline::reader",
                    "Dropping {} frame without message id",
                    response.command()
                );
            }
            return;
        };

        let command = response.command().to_string();
        if self.table.resolve(&id, response) {
            trace!(target: "subline::reader", "Routed {} response {}", command, id);
        } else if notification {
            trace!(target: "subline::reader", "Notification {} matched no request", id);
        } else {
            warn!(
                target: "subline::reader",
                "Orphan {} response for message id {}",
                command,
                id
            );
        }
    }

    fn notify(&self, response: &Response) {
        for record in response.objects() {
            let listeners = self.registry.listeners(record.topic());
            if listeners.is_empty() {
                debug!(
                    target: "subline::reader",
                    "No listeners for update on {}",
                    record.topic()
                );
                continue;
            }
            if !self.deliveries.dispatch(Delivery::new(record.clone(), listeners)) {
                debug!(
                    target: "subline::reader",
                    "Dispatcher stopped, dropping update on {}",
                    record.topic()
                );
            }
        }
    }
}

/// Spawn a reader task that routes frames from `reader`.
pub(crate) fn spawn_reader_task<R>(
    reader: R,
    router: FrameRouter,
    failure: FailureNotifier,
) -> ReaderTaskHandle
where
    R: Stream<Item = io::Result<Frame>> + Unpin + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(reader_loop(reader, router, failure, cancel_token.clone()));

    ReaderTaskHandle {
        join_handle,
        cancel_token,
    }
}

async fn reader_loop<R>(
    mut reader: R,
    router: FrameRouter,
    failure: FailureNotifier,
    cancel_token: CancellationToken,
) where
    R: Stream<Item = io::Result<Frame>> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!(
                    target: "subline::reader",
                    "Reader task cancelled, shutting down"
                );
                break;
            }

            next = reader.next() => match next {
                Some(Ok(frame)) => router.handle_frame(frame),
                Some(Err(e)) => {
                    warn!(target: "subline::reader", "Read error: {}", e);
                    failure.notify(format!("read error: {}", e));
                    break;
                }
                None => {
                    debug!(target: "subline::reader", "Controller closed the connection");
                    failure.notify("connection closed by controller");
                    break;
                }
            }
        }
    }
}

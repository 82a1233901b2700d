//! Writer task for the controller socket.
//!
//! This module provides the single-writer actor that consumes the outbound
//! queue and writes each frame to the socket. Callers never touch the write
//! half; the queue serializes them, so frames are never interleaved.
//!
//! # Failure handling
//!
//! A write error fails the request being written with `TransportLost`,
//! fails everything still queued, reports the failure to the supervisor,
//! and ends the task. The supervisor then fails whatever is still pending
//! and reconnects.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CorrelationTable, FailureNotifier, OutboundMessage};
use crate::error::ClientError;

/// How long a graceful shutdown waits for an in-progress write.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Handle to a running writer task, managing its lifetime via RAII.
///
/// Dropping the handle cancels and aborts the task.
pub(crate) struct WriterTaskHandle {
    join_handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

impl WriterTaskHandle {
    /// Signal the task to stop without waiting for it.
    pub(crate) fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Stop the task and wait for it to exit, aborting it if a write is stuck.
    pub(crate) async fn shutdown(mut self) {
        self.cancel_token.cancel();
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.join_handle)
            .await
            .is_err()
        {
            log::debug!(
                target: "subline::writer",
                "Writer task did not stop within {:?}, aborting",
                SHUTDOWN_GRACE
            );
            self.join_handle.abort();
        }
    }
}

impl Drop for WriterTaskHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.join_handle.abort();
    }
}

/// Spawn a writer task that writes queued frames to `writer`.
///
/// # Arguments
/// * `writer` - Framed write half of the socket
/// * `rx` - Receiver for outbound messages
/// * `table` - Correlation table, for failing requests that cannot be written
/// * `failure` - Reports a broken connection to the supervisor
pub(crate) fn spawn_writer_task<W>(
    writer: W,
    rx: mpsc::Receiver<OutboundMessage>,
    table: Arc<CorrelationTable>,
    failure: FailureNotifier,
) -> WriterTaskHandle
where
    W: Sink<Bytes, Error = io::Error> + Unpin + Send + 'static,
{
    let cancel_token = CancellationToken::new();
    let join_handle = tokio::spawn(writer_loop(
        writer,
        rx,
        table,
        failure,
        cancel_token.clone(),
    ));

    WriterTaskHandle {
        join_handle,
        cancel_token,
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<OutboundMessage>,
    table: Arc<CorrelationTable>,
    failure: FailureNotifier,
    cancel_token: CancellationToken,
) where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log::debug!(
                    target: "subline::writer",
                    "Writer task cancelled, shutting down"
                );
                fail_queued(&mut rx, &table, "connection closing");
                return;
            }

            msg = rx.recv() => {
                let Some(outbound) = msg else {
                    log::debug!(
                        target: "subline::writer",
                        "Outbound queue closed, writer exiting"
                    );
                    return;
                };

                log::trace!(
                    target: "subline::writer",
                    "Sending {}",
                    String::from_utf8_lossy(outbound.payload.trim_ascii_end())
                );
                if let Err(e) = writer.send(outbound.payload).await {
                    let reason = format!("write error: {}", e);
                    log::warn!(
                        target: "subline::writer",
                        "{}, failing request {}",
                        reason,
                        outbound.message_id
                    );
                    table.fail(&outbound.message_id, ClientError::transport_lost(&reason));
                    fail_queued(&mut rx, &table, &reason);
                    failure.notify(reason);
                    return;
                }
            }
        }
    }
}

/// Fail requests that were queued but never written.
fn fail_queued(rx: &mut mpsc::Receiver<OutboundMessage>, table: &CorrelationTable, reason: &str) {
    rx.close();
    while let Ok(msg) = rx.try_recv() {
        table.fail(&msg.message_id, ClientError::transport_lost(reason));
    }
}

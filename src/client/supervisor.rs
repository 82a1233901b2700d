//! Connection supervisor.
//!
//! Sole owner of state transitions. It brings a link up, reacts to failure
//! reports from the link's reader and writer tasks, and tears everything
//! down on close.
//!
//! On transport loss every pending request fails with `TransportLost`
//! before a single reconnect is attempted; after a successful reconnect
//! each active topic is subscribed again so listeners keep receiving
//! updates. If the attempt fails the client stays `Disconnected`.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::Shared;
use super::connection_state::ConnectionState;
use crate::actor::{
    FailureNotifier, FrameRouter, LinkFailure, OutboundMessage, ReaderTaskHandle,
    WriterTaskHandle, spawn_reader_task, spawn_writer_task,
};
use crate::error::{ClientError, Result};
use crate::protocol::Request;
use crate::transport::Transport;

/// One live connection: its outbound queue and the tasks serving it.
pub(super) struct Link {
    pub(super) generation: u64,
    outbound: mpsc::Sender<OutboundMessage>,
    reader: ReaderTaskHandle,
    writer: WriterTaskHandle,
}

impl Link {
    fn start(shared: &Shared, transport: Transport) -> Self {
        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let failure = FailureNotifier::new(generation, shared.failures.clone());
        let (frames, sink) = transport.split();
        let (outbound, rx) = mpsc::channel(shared.config.outbound_queue_capacity);

        let writer = spawn_writer_task(sink, rx, Arc::clone(&shared.table), failure.clone());
        let reader = spawn_reader_task(
            frames,
            FrameRouter::new(
                Arc::clone(&shared.table),
                Arc::clone(&shared.registry),
                shared.dispatcher.queue(),
            ),
            failure,
        );

        Self {
            generation,
            outbound,
            reader,
            writer,
        }
    }

    /// Queue an encoded frame without waiting.
    pub(super) fn try_send(&self, message: OutboundMessage) -> std::result::Result<(), TrySendError<OutboundMessage>> {
        self.outbound.try_send(message)
    }

    fn cancel(&self) {
        self.reader.cancel();
        self.writer.cancel();
    }

    async fn shutdown(self) {
        self.writer.shutdown().await;
        self.reader.shutdown().await;
    }
}

/// Connect and install a new link.
pub(super) async fn establish(shared: &Arc<Shared>) -> Result<()> {
    if !shared.state.set_unless_closing(ConnectionState::Connecting) {
        return Err(ClientError::Disconnected);
    }

    let transport = match Transport::connect(&shared.config).await {
        Ok(transport) => transport,
        Err(e) => {
            shared.state.set_unless_closing(ConnectionState::Disconnected);
            return Err(e);
        }
    };

    let link = Arc::new(Link::start(shared, transport));
    shared.link.store(Some(Arc::clone(&link)));
    if !shared.state.set_unless_closing(ConnectionState::Connected) {
        // close() ran while connecting
        shared.link.store(None);
        link.cancel();
        return Err(ClientError::Disconnected);
    }
    debug!(
        target: "subline::supervisor",
        "Link {} established to {}",
        link.generation,
        shared.config.address()
    );
    Ok(())
}

pub(super) fn spawn(shared: Arc<Shared>, failures: mpsc::UnboundedReceiver<LinkFailure>) -> JoinHandle<()> {
    tokio::spawn(run(shared, failures))
}

async fn run(shared: Arc<Shared>, mut failures: mpsc::UnboundedReceiver<LinkFailure>) {
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            failure = failures.recv() => match failure {
                Some(failure) => recover(&shared, failure).await,
                None => break,
            }
        }
    }
    debug!(target: "subline::supervisor", "Supervisor exiting");
}

async fn recover(shared: &Arc<Shared>, failure: LinkFailure) {
    let current = shared.link.load_full().map(|link| link.generation);
    if current != Some(failure.generation) {
        debug!(
            target: "subline::supervisor",
            "Ignoring failure report for stale link {}: {}",
            failure.generation,
            failure.reason
        );
        return;
    }

    warn!(target: "subline::supervisor", "Connection lost: {}", failure.reason);
    if !shared.state.set_unless_closing(ConnectionState::Disconnected) {
        return;
    }
    if let Some(link) = shared.link.swap(None) {
        link.cancel();
    }
    let failed = shared
        .table
        .fail_all(ClientError::transport_lost(&failure.reason));
    if failed > 0 {
        info!(
            target: "subline::supervisor",
            "Failed {} pending request(s) after connection loss",
            failed
        );
    }

    if !shared.config.auto_reconnect {
        info!(
            target: "subline::supervisor",
            "Automatic reconnect disabled; client stays disconnected"
        );
        return;
    }

    let attempt = tokio::select! {
        _ = shared.shutdown.cancelled() => return,
        attempt = establish(shared) => attempt,
    };
    match attempt {
        Ok(()) => {
            info!(
                target: "subline::supervisor",
                "Reconnected to {}",
                shared.config.address()
            );
            resubscribe(shared).await;
        }
        Err(e) => {
            error!(
                target: "subline::supervisor",
                "Reconnect to {} failed, giving up: {}",
                shared.config.address(),
                e
            );
        }
    }
}

/// Request every active topic again on the fresh link.
///
/// Topics still pending are left to their subscriber, which checks
/// `resubscribed_generation` when its acknowledgement arrives.
async fn resubscribe(shared: &Shared) {
    let _guard = shared.subscription_lock.lock().await;
    if let Some(generation) = shared.link_generation() {
        shared
            .resubscribed_generation
            .store(generation, Ordering::Release);
    }
    for (topic, keys) in shared.registry.active_topics() {
        match shared.submit(Request::subscribe(&topic, &keys), shared.config.request_timeout()) {
            Ok(ack) => super::log_ack_in_background("resubscribe", topic, ack),
            Err(e) => warn!(
                target: "subline::supervisor",
                "Could not resubscribe to {}: {}",
                topic,
                e
            ),
        }
    }
}

/// Stop accepting work and fail everything pending.
///
/// Returns the link that was live, or `None` if there was none. Safe to
/// call more than once.
pub(super) fn begin_close(shared: &Shared, reason: &str) -> Option<Arc<Link>> {
    shared.state.set(ConnectionState::Closing);
    shared.shutdown.cancel();
    let link = shared.link.swap(None);

    let cancelled = shared.table.fail_all(ClientError::cancelled(reason));
    if cancelled > 0 {
        debug!(
            target: "subline::supervisor",
            "Cancelled {} pending request(s): {}",
            cancelled,
            reason
        );
    }
    shared.registry.clear();
    link
}

/// Graceful close: wait for the link tasks and queued notifications.
pub(super) async fn close(shared: &Shared) {
    if let Some(link) = begin_close(shared, "client closed") {
        match Arc::try_unwrap(link) {
            Ok(link) => link.shutdown().await,
            Err(link) => link.cancel(),
        }
    }
    shared.dispatcher.shutdown().await;
    shared.state.set(ConnectionState::Disconnected);
}

/// Close without waiting, for use from `Drop`.
pub(super) fn close_now(shared: &Shared) {
    if let Some(link) = begin_close(shared, "client dropped") {
        link.cancel();
    }
    let _ = shared.dispatcher.stop();
    shared.state.set(ConnectionState::Disconnected);
}

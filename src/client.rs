//! The client facade: requests, responses and topic subscriptions over one
//! persistent controller connection.
//!
//! # Request flow
//!
//! 1. Assign a message id if the request has none
//! 2. Register the id in the correlation table (before any byte is written)
//! 3. Enqueue the encoded frame on the bounded outbound queue
//! 4. Hand back a [`ResponseFuture`]; the caller awaits it without any lock
//!
//! # Subscriptions
//!
//! Listeners are reference counted per topic. Only the first listener for a
//! topic sends `RequestParamList` and only the last one to leave sends
//! `ReleaseParamList`. The first listener is registered, pending, before the
//! request goes out, so updates pushed right behind the acknowledgement are
//! delivered. Registry changes and the frames they cause happen under one
//! short lock that is never held while waiting for the controller.

mod connection_state;
mod supervisor;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use connection_state::ConnectionState;
use connection_state::StateCell;
use supervisor::Link;

use crate::actor::{CorrelationTable, LinkFailure, OutboundMessage, ResponseFuture};
use crate::config::ClientConfig;
use crate::error::{ClientError, LockResultExt, Result};
use crate::protocol::{ObjectRecord, Request, Response, codec};
use crate::subscription::{
    Attach, JoinedListener, Listener, NotificationDispatcher, PendingTopic, Removal,
    SubscriptionHandle, SubscriptionRegistry,
};

/// State shared between the client, its supervisor and the link tasks.
struct Shared {
    config: ClientConfig,
    state: StateCell,
    link: ArcSwapOption<Link>,
    table: Arc<CorrelationTable>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: NotificationDispatcher,
    failures: mpsc::UnboundedSender<LinkFailure>,
    next_generation: AtomicU64,
    /// Generation of the last link whose topics were subscribed again.
    resubscribed_generation: AtomicU64,
    /// Orders registry changes with the subscribe and release frames they send.
    subscription_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Shared {
    fn link_generation(&self) -> Option<u64> {
        self.link.load().as_ref().map(|link| link.generation)
    }

    fn submit(&self, mut request: Request, deadline: Option<Duration>) -> Result<ResponseFuture> {
        let state = self.state.get();
        if state != ConnectionState::Connected {
            return Err(state.unavailable_error());
        }
        let Some(link) = self.link.load_full() else {
            return Err(self.state.get().unavailable_error());
        };

        let id = request.ensure_message_id();
        let payload = codec::encode_request(&request)?;
        let response = self
            .table
            .register(id.clone(), deadline)
            .ok_or_else(|| ClientError::DuplicateMessageId(id.to_string()))?;

        match link.try_send(OutboundMessage::new(payload, id)) {
            Ok(()) => Ok(response),
            Err(TrySendError::Full(_)) => {
                response.cancel();
                Err(ClientError::QueueFull {
                    capacity: self.config.outbound_queue_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => {
                response.cancel();
                Err(ClientError::transport_lost("writer stopped"))
            }
        }
    }
}

/// Await a fire-and-forget acknowledgement and log how it went.
fn log_ack_in_background(action: &'static str, topic: String, ack: ResponseFuture) {
    tokio::spawn(async move {
        match ack.await {
            Ok(response) if response.is_ok() => {
                debug!(target: "subline::client", "{} {} acknowledged", action, topic);
            }
            Ok(response) => warn!(
                target: "subline::client",
                "{} {} rejected: {}",
                action,
                topic,
                response.failure_reason()
            ),
            Err(e) => warn!(
                target: "subline::client",
                "{} {} failed: {}",
                action,
                topic,
                e
            ),
        }
    });
}

/// How a subscribe call attached its listener.
enum Subscribing {
    /// First listener of the topic, with the upstream request in flight.
    First {
        pending: PendingTopic,
        ack: ResponseFuture,
        generation: Option<u64>,
    },
    Joining(JoinedListener),
}

/// A connected controller client.
///
/// All methods take `&self`; share the client behind an `Arc` to use it
/// from several tasks. Dropping the client without calling
/// [`Client::close`] cancels pending requests and stops its background
/// tasks without waiting for them.
pub struct Client {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Connect to the controller described by `config`.
    ///
    /// Fails with [`ClientError::Connection`] when the controller cannot be
    /// reached; no background task outlives a failed connect.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let dispatcher = NotificationDispatcher::start()
            .map_err(|e| ClientError::connection(config.address(), &e))?;
        let (failures, failure_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            config,
            state: StateCell::new(ConnectionState::Disconnected),
            link: ArcSwapOption::empty(),
            table: CorrelationTable::new(),
            registry: Arc::new(SubscriptionRegistry::new()),
            dispatcher,
            failures,
            next_generation: AtomicU64::new(1),
            resubscribed_generation: AtomicU64::new(0),
            subscription_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        });

        supervisor::establish(&shared).await?;
        info!(
            target: "subline::client",
            "Connected to {}",
            shared.config.address()
        );

        let handle = supervisor::spawn(Arc::clone(&shared), failure_rx);
        Ok(Self {
            shared,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Number of requests waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.table.pending_count()
    }

    /// Number of listeners currently registered for `topic`.
    pub fn listener_count(&self, topic: &str) -> usize {
        self.shared.registry.listener_count(topic)
    }

    /// Send `request` and return a future for its response.
    ///
    /// The request is registered and queued before this returns; it is not
    /// necessarily written yet. A missing message id is generated. The
    /// configured request timeout, if any, applies to the returned future.
    pub fn submit(&self, request: Request) -> Result<ResponseFuture> {
        self.shared.submit(request, self.shared.config.request_timeout())
    }

    /// Like [`Client::submit`] with an explicit deadline for this request.
    pub fn submit_with_timeout(&self, request: Request, timeout: Duration) -> Result<ResponseFuture> {
        self.shared.submit(request, Some(timeout))
    }

    /// Send `command` with `params` and wait for the response.
    ///
    /// A non-success status is returned as a normal [`Response`]; inspect
    /// [`Response::status`].
    pub async fn call(&self, command: &str, params: Value) -> Result<Response> {
        self.submit(Request::new(command).with_params(params))?.await
    }

    /// Register `listener` for updates on `topic`.
    ///
    /// The first listener for a topic subscribes upstream and waits for the
    /// acknowledgement; later ones attach locally and wait for the same
    /// acknowledgement. A listener may see updates before this returns.
    /// Listeners run on the notifier thread and must not block for long.
    pub async fn subscribe<F>(&self, topic: &str, listener: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&ObjectRecord) + Send + Sync + 'static,
    {
        self.subscribe_with_keys(topic, Vec::new(), listener).await
    }

    /// Like [`Client::subscribe`], asking the controller for specific
    /// parameter keys. Keys only take effect for the first listener of a topic.
    pub async fn subscribe_with_keys<F>(
        &self,
        topic: &str,
        keys: Vec<String>,
        listener: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&ObjectRecord) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);

        let subscribing = {
            let _guard = self.shared.subscription_lock.lock().await;
            match self.shared.registry.attach(topic, keys.clone(), listener) {
                Attach::Joined(joined) => Subscribing::Joining(joined),
                Attach::New(pending) => {
                    let generation = self.shared.link_generation();
                    match self.submit(Request::subscribe(topic, &keys)) {
                        Ok(ack) => Subscribing::First {
                            pending,
                            ack,
                            generation,
                        },
                        Err(e) => {
                            pending.reject(e.clone());
                            return Err(e);
                        }
                    }
                }
            }
        };

        match subscribing {
            Subscribing::Joining(joined) => {
                let handle = joined.wait().await?;
                debug!(
                    target: "subline::client",
                    "Attached listener to {} ({} total)",
                    topic,
                    self.shared.registry.listener_count(topic)
                );
                Ok(handle)
            }
            Subscribing::First {
                pending,
                ack,
                generation,
            } => self.confirm_subscription(topic, &keys, pending, ack, generation).await,
        }
    }

    async fn confirm_subscription(
        &self,
        topic: &str,
        keys: &[String],
        pending: PendingTopic,
        ack: ResponseFuture,
        generation: Option<u64>,
    ) -> Result<SubscriptionHandle> {
        let response = match ack.await {
            Ok(response) => response,
            Err(e) => {
                pending.reject(e.clone());
                return Err(e);
            }
        };
        if !response.is_ok() {
            let error = ClientError::subscription(topic, response.failure_reason());
            pending.reject(error.clone());
            return Err(error);
        }

        let _guard = self.shared.subscription_lock.lock().await;
        let handle = pending.activate()?;
        info!(target: "subline::client", "Subscribed to {}", topic);

        let resubscribed = self.shared.resubscribed_generation.load(Ordering::Acquire);
        if resubscribed > generation.unwrap_or(0) {
            // Acknowledged by a link that was replaced and resubscribed meanwhile
            match self.submit(Request::subscribe(topic, keys)) {
                Ok(ack) => log_ack_in_background("resubscribe", topic.to_string(), ack),
                Err(e) => warn!(
                    target: "subline::client",
                    "Could not resubscribe to {}: {}",
                    topic,
                    e
                ),
            }
        }
        Ok(handle)
    }

    /// Remove the listener behind `handle`.
    ///
    /// When it was the topic's last listener the upstream subscription is
    /// released in the background; failures are logged, never returned.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let _guard = self.shared.subscription_lock.lock().await;

        match self.shared.registry.remove(&handle) {
            Removal::NotFound => {
                debug!(
                    target: "subline::client",
                    "Listener on {} was already removed",
                    handle.topic()
                );
            }
            Removal::Remaining(count) => {
                debug!(
                    target: "subline::client",
                    "Detached listener from {} ({} remaining)",
                    handle.topic(),
                    count
                );
            }
            Removal::LastListener => {
                let topic = handle.topic().to_string();
                match self.submit(Request::release(&topic)) {
                    Ok(ack) => log_ack_in_background("release", topic, ack),
                    Err(e) => warn!(
                        target: "subline::client",
                        "Could not release {}: {}",
                        topic,
                        e
                    ),
                }
            }
        }
    }

    /// Shut the client down.
    ///
    /// Pending requests fail with [`ClientError::Cancelled`], listeners are
    /// dropped after queued notifications are delivered, and later calls
    /// fail with [`ClientError::Disconnected`]. Calling it again is a no-op.
    pub async fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        info!(target: "subline::client", "Closing connection to {}", self.shared.config.address());
        supervisor::close(&self.shared).await;

        let handle = self
            .supervisor
            .lock()
            .recover_poison("Client::close")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.shared.shutdown.is_cancelled() {
            supervisor::close_now(&self.shared);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("address", &self.shared.config.address())
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

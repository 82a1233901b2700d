//! Topic-keyed listener registry.
//!
//! One entry per topic with an upstream subscription, requested or active.
//! The number of listeners on an entry is its reference count: the upstream
//! subscription is requested when the first listener arrives and released
//! when the last one leaves.
//!
//! A new entry is created *pending*, with its first listener already
//! attached, before the subscribe request goes out. Updates the controller
//! pushes right behind its acknowledgement therefore find a listener. The
//! acknowledgement outcome is published through a `watch` channel so that
//! listeners joining a pending topic wait for it without holding any lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;

use crate::error::{ClientError, Result};
use crate::protocol::ObjectRecord;

/// Callback invoked with each update for a subscribed topic.
pub(crate) type Listener = Arc<dyn Fn(&ObjectRecord) + Send + Sync>;

/// Token for one registered listener, consumed by `Client::unsubscribe`.
#[derive(Debug, PartialEq, Eq)]
pub struct SubscriptionHandle {
    topic: String,
    listener_id: u64,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// Upstream state of a topic entry.
#[derive(Debug, Clone)]
pub(crate) enum AckState {
    Pending,
    Active,
    Rejected(ClientError),
}

impl AckState {
    fn is_settled(&self) -> bool {
        !matches!(self, AckState::Pending)
    }
}

struct TopicEntry {
    /// Distinguishes this entry from a later one for the same topic.
    subscription_id: u64,
    keys: Vec<String>,
    listeners: Vec<(u64, Listener)>,
    ack: watch::Receiver<AckState>,
}

/// Outcome of removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    /// The handle did not match a registered listener.
    NotFound,
    /// Other listeners remain on the topic.
    Remaining(usize),
    /// The topic has no listeners left and its entry is gone.
    LastListener,
}

/// Result of attaching a listener.
pub(crate) enum Attach {
    /// The topic had no entry. The caller must subscribe upstream and then
    /// settle the pending entry.
    New(PendingTopic),
    /// The topic already had an entry; wait for its acknowledgement.
    Joined(JoinedListener),
}

#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    topics: DashMap<String, TopicEntry>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach `listener` to `topic`, creating a pending entry if none exists.
    ///
    /// `keys` only matter when a new entry is created.
    pub(crate) fn attach(
        self: &Arc<Self>,
        topic: &str,
        keys: Vec<String>,
        listener: Listener,
    ) -> Attach {
        let handle = SubscriptionHandle {
            topic: topic.to_string(),
            listener_id: self.next_id(),
        };

        match self.topics.entry(topic.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                entry.listeners.push((handle.listener_id, listener));
                Attach::Joined(JoinedListener {
                    registry: Arc::clone(self),
                    ack: entry.ack.clone(),
                    handle: Some(handle),
                })
            }
            Entry::Vacant(vacant) => {
                let (ack_tx, ack_rx) = watch::channel(AckState::Pending);
                let subscription_id = self.next_id();
                vacant.insert(TopicEntry {
                    subscription_id,
                    keys,
                    listeners: vec![(handle.listener_id, listener)],
                    ack: ack_rx,
                });
                Attach::New(PendingTopic {
                    registry: Arc::clone(self),
                    subscription_id,
                    ack: ack_tx,
                    handle: Some(handle),
                })
            }
        }
    }

    pub(crate) fn remove(&self, handle: &SubscriptionHandle) -> Removal {
        let remaining = {
            let Some(mut entry) = self.topics.get_mut(&handle.topic) else {
                return Removal::NotFound;
            };
            let before = entry.listeners.len();
            entry.listeners.retain(|(id, _)| *id != handle.listener_id);
            if entry.listeners.len() == before {
                return Removal::NotFound;
            }
            entry.listeners.len()
        };

        if remaining > 0 {
            return Removal::Remaining(remaining);
        }
        self.topics
            .remove_if(&handle.topic, |_, entry| entry.listeners.is_empty());
        Removal::LastListener
    }

    /// Snapshot of a topic's listeners in registration order.
    ///
    /// Pending topics are included so nothing pushed right after the
    /// acknowledgement is lost.
    pub(crate) fn listeners(&self, topic: &str) -> Vec<Listener> {
        self.topics
            .get(topic)
            .map(|entry| entry.listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Every acknowledged topic with the keys it was subscribed with.
    pub(crate) fn active_topics(&self) -> Vec<(String, Vec<String>)> {
        self.topics
            .iter()
            .filter(|entry| matches!(*entry.ack.borrow(), AckState::Active))
            .map(|entry| (entry.key().clone(), entry.value().keys.clone()))
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.topics.clear();
    }
}

/// First listener of a topic whose upstream subscription is not yet settled.
///
/// Dropping it unsettled rejects the entry as cancelled.
pub(crate) struct PendingTopic {
    registry: Arc<SubscriptionRegistry>,
    subscription_id: u64,
    ack: watch::Sender<AckState>,
    handle: Option<SubscriptionHandle>,
}

impl PendingTopic {
    /// Mark the topic acknowledged and hand out the first listener's handle.
    pub(crate) fn activate(mut self) -> Result<SubscriptionHandle> {
        self.ack.send_replace(AckState::Active);
        self.handle
            .take()
            .ok_or_else(|| ClientError::cancelled("subscription already settled"))
    }

    /// Remove the entry with every listener on it and fail joined waiters.
    pub(crate) fn reject(mut self, error: ClientError) {
        self.settle_rejected(error);
    }

    fn settle_rejected(&mut self, error: ClientError) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let id = self.subscription_id;
        self.registry
            .topics
            .remove_if(&handle.topic, |_, entry| entry.subscription_id == id);
        self.ack.send_replace(AckState::Rejected(error));
    }
}

impl Drop for PendingTopic {
    fn drop(&mut self) {
        if self.handle.is_some() {
            log::debug!(
                target: "subline::client",
                "Subscribe abandoned before its acknowledgement"
            );
            self.settle_rejected(ClientError::cancelled("subscribe abandoned"));
        }
    }
}

/// A listener attached to an existing entry, waiting for that entry's
/// acknowledgement.
///
/// Dropping it before [`JoinedListener::wait`] completes detaches the listener.
pub(crate) struct JoinedListener {
    registry: Arc<SubscriptionRegistry>,
    ack: watch::Receiver<AckState>,
    handle: Option<SubscriptionHandle>,
}

impl JoinedListener {
    pub(crate) async fn wait(mut self) -> Result<SubscriptionHandle> {
        let state = match self.ack.wait_for(AckState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => AckState::Rejected(ClientError::cancelled("subscription abandoned")),
        };

        match state {
            AckState::Active => self
                .handle
                .take()
                .ok_or_else(|| ClientError::cancelled("subscription already settled")),
            // The whole entry is gone already; nothing left to detach
            AckState::Rejected(error) => {
                self.handle = None;
                Err(error)
            }
            AckState::Pending => Err(ClientError::cancelled("subscription abandoned")),
        }
    }
}

impl Drop for JoinedListener {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take()
            && self.registry.remove(&handle) == Removal::LastListener
        {
            log::debug!(
                target: "subline::client",
                "Last listener for {} abandoned while joining; upstream subscription kept",
                handle.topic()
            );
        }
    }
}

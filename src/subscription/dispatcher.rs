//! Notification delivery off the reader task.
//!
//! Listeners run on one dedicated OS thread fed by an unbounded queue. The
//! reader only enqueues, so a slow listener delays later notifications but
//! never response routing. A single consumer keeps per-topic delivery in
//! arrival order.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::thread;

use tokio::sync::mpsc;

use super::registry::Listener;
use crate::error::LockResultExt;
use crate::protocol::ObjectRecord;

const THREAD_NAME: &str = "subline-notifier";

/// One update for one topic, with the listeners registered when it arrived.
pub(crate) struct Delivery {
    record: ObjectRecord,
    listeners: Vec<Listener>,
}

impl Delivery {
    pub(crate) fn new(record: ObjectRecord, listeners: Vec<Listener>) -> Self {
        Self { record, listeners }
    }

    fn run(self) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(&self.record))).is_err() {
                log::warn!(
                    target: "subline::dispatcher",
                    "Listener for {} panicked; continuing with remaining listeners",
                    self.record.topic()
                );
            }
        }
    }
}

enum Job {
    Deliver(Delivery),
    Stop,
}

/// Cloneable enqueue side, held by reader tasks.
#[derive(Clone)]
pub(crate) struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl DeliveryQueue {
    /// Queue a delivery. Returns `false` once the dispatcher has stopped.
    pub(crate) fn dispatch(&self, delivery: Delivery) -> bool {
        self.tx.send(Job::Deliver(delivery)).is_ok()
    }
}

pub(crate) struct NotificationDispatcher {
    queue: DeliveryQueue,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl NotificationDispatcher {
    pub(crate) fn start() -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    match job {
                        Job::Deliver(delivery) => delivery.run(),
                        Job::Stop => break,
                    }
                }
                log::debug!(target: "subline::dispatcher", "Notifier thread exiting");
            })?;

        Ok(Self {
            queue: DeliveryQueue { tx },
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn queue(&self) -> DeliveryQueue {
        self.queue.clone()
    }

    /// Ask the thread to exit after the deliveries already queued.
    ///
    /// Returns the thread handle the first time it is called.
    pub(crate) fn stop(&self) -> Option<thread::JoinHandle<()>> {
        let _ = self.queue.tx.send(Job::Stop);
        self.thread
            .lock()
            .recover_poison("NotificationDispatcher::stop")
            .take()
    }

    /// Stop and wait for queued deliveries to finish.
    pub(crate) async fn shutdown(&self) {
        let Some(thread) = self.stop() else {
            return;
        };
        let joined = tokio::task::spawn_blocking(move || thread.join()).await;
        if !matches!(joined, Ok(Ok(()))) {
            log::warn!(target: "subline::dispatcher", "Notifier thread did not exit cleanly");
        }
    }
}

impl Drop for NotificationDispatcher {
    fn drop(&mut self) {
        // Detach; the thread exits on its own once it reaches the stop job
        let _ = self.stop();
    }
}

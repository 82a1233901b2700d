//! Failure signal from the reader/writer tasks to the supervisor.

use tokio::sync::mpsc;

/// Report that the connection with the given generation is unusable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LinkFailure {
    pub(crate) generation: u64,
    pub(crate) reason: String,
}

/// Sender half handed to the tasks of one connection.
///
/// Both tasks may report the same broken socket; the generation lets the
/// supervisor ignore duplicates and reports about connections it already
/// replaced.
#[derive(Debug, Clone)]
pub(crate) struct FailureNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<LinkFailure>,
}

impl FailureNotifier {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<LinkFailure>) -> Self {
        Self { generation, tx }
    }

    pub(crate) fn notify(&self, reason: impl Into<String>) {
        // Supervisor already gone means the client is shutting down
        let _ = self.tx.send(LinkFailure {
            generation: self.generation,
            reason: reason.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_tags_failure_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        FailureNotifier::new(3, tx).notify("eof");

        assert_eq!(
            rx.try_recv().unwrap(),
            LinkFailure {
                generation: 3,
                reason: "eof".to_string()
            }
        );
    }

    #[test]
    fn notify_after_receiver_dropped_is_silent() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        FailureNotifier::new(1, tx).notify("late");
    }
}

//! Connection state machine for the controller link.

use std::fmt;
use std::sync::RwLock;

use crate::error::{ClientError, LockResultExt};

/// Lifecycle state of a client's connection.
///
/// Transitions, all made by the supervisor:
/// - Disconnected -> Connecting (initial connect or reconnect attempt)
/// - Connecting -> Connected (socket up, reader and writer running)
/// - Connecting -> Disconnected (attempt failed)
/// - Connected -> Disconnected (transport lost)
/// - any -> Closing -> Disconnected (`close()`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

impl ConnectionState {
    /// The error a submission gets while the client is in this state.
    pub(crate) fn unavailable_error(self) -> ClientError {
        match self {
            ConnectionState::Connecting => ClientError::Reconnecting,
            _ => ClientError::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Shared state cell with synchronous reads.
pub(crate) struct StateCell {
    state: RwLock<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new(initial: ConnectionState) -> Self {
        Self {
            state: RwLock::new(initial),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.read().recover_poison("StateCell::get")
    }

    pub(super) fn set(&self, next: ConnectionState) {
        let mut state = self.state.write().recover_poison("StateCell::set");
        if *state != next {
            log::debug!(
                target: "subline::supervisor",
                "Connection state {} -> {}",
                *state,
                next
            );
            *state = next;
        }
    }

    /// Move to `next` unless the client is closing.
    ///
    /// Returns `false` when the transition was refused.
    pub(super) fn set_unless_closing(&self, next: ConnectionState) -> bool {
        let mut state = self.state.write().recover_poison("StateCell::set_unless_closing");
        if *state == ConnectionState::Closing {
            return false;
        }
        *state = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connecting_reports_reconnecting_others_disconnected() {
        assert!(matches!(
            ConnectionState::Connecting.unavailable_error(),
            ClientError::Reconnecting
        ));
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Closing,
            ConnectionState::Connected,
        ] {
            assert!(matches!(state.unavailable_error(), ClientError::Disconnected));
        }
    }

    #[test]
    fn closing_blocks_further_transitions() {
        let cell = StateCell::new(ConnectionState::Connected);
        assert!(cell.set_unless_closing(ConnectionState::Connecting));
        assert_eq!(cell.get(), ConnectionState::Connecting);

        cell.set(ConnectionState::Closing);
        assert!(!cell.set_unless_closing(ConnectionState::Connected));
        assert_eq!(cell.get(), ConnectionState::Closing);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}

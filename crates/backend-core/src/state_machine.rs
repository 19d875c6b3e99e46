use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::BackendError;

/// Lifecycle state of one connection.
///
/// The binary client walks every state in order. The long-poll client skips
/// `Handshaking`; its `LoggingIn`/`InitialSync`/`Polling` phases map onto
/// `Authenticating`/`Syncing`/`Connected`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Disconnected,
    /// Transport is open and the TLS handshake is running.
    Handshaking,
    /// Credentials are being exchanged.
    Authenticating,
    /// Authenticated; waiting for the initial state sync to complete.
    Syncing,
    /// Steady-state receive loop is running.
    Connected,
}

/// Validated lifecycle transitions published through a `watch` channel.
#[derive(Debug)]
pub struct ConnectionStateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        let (tx, _) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    pub fn transition(&self, next: ConnectionState) -> Result<(), BackendError> {
        let current = self.state();
        if !is_allowed(current, next) {
            return Err(BackendError::invalid_state(
                current,
                format!("transition to {next:?}"),
            ));
        }
        self.tx.send_replace(next);
        debug!(from = ?current, to = ?next, "connection state changed");
        Ok(())
    }

    /// Drop back to `Disconnected`; allowed from every state.
    pub fn disconnect(&self) {
        let previous = self.tx.send_replace(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            debug!(from = ?previous, "connection state changed to Disconnected");
        }
    }
}

fn is_allowed(current: ConnectionState, next: ConnectionState) -> bool {
    use ConnectionState::*;

    matches!(
        (current, next),
        (Disconnected, Handshaking)
            | (Disconnected, Authenticating)
            | (Handshaking, Authenticating)
            | (Authenticating, Syncing)
            | (Syncing, Connected)
            | (_, Disconnected)
    )
}

use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use crate::types::{Channel, Message, Reaction};

/// Subscriber to one connection's events.
///
/// Callbacks run inline on the emitting connection's receive task, one
/// listener after another. A slow listener stalls that connection.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    /// Raised once per successful session, before the steady-state loop.
    async fn on_connected(&self, _connection_id: &str) {}

    /// Raised once per inbound message.
    async fn on_message(&self, _message: &Message) {}

    /// Raised once per inbound reaction.
    async fn on_reaction(&self, _reaction: &Reaction) {}

    /// Raised with a complete snapshot whenever any channel or membership
    /// fact changes.
    async fn on_channels_updated(&self, _connection_id: &str, _channels: &[Channel]) {}
}

/// Listener registry owned by a connection.
#[derive(Default)]
pub struct ConnectionEvents {
    listeners: RwLock<Vec<Arc<dyn ConnectionListener>>>,
}

impl ConnectionEvents {
    pub fn subscribe(&self, listener: Arc<dyn ConnectionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub async fn emit_connected(&self, connection_id: &str) {
        for listener in self.snapshot() {
            listener.on_connected(connection_id).await;
        }
    }

    pub async fn emit_message(&self, message: &Message) {
        for listener in self.snapshot() {
            listener.on_message(message).await;
        }
    }

    pub async fn emit_reaction(&self, reaction: &Reaction) {
        for listener in self.snapshot() {
            listener.on_reaction(reaction).await;
        }
    }

    pub async fn emit_channels_updated(&self, connection_id: &str, channels: &[Channel]) {
        for listener in self.snapshot() {
            listener.on_channels_updated(connection_id, channels).await;
        }
    }

    // Clone the list so no lock is held across listener awaits.
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionListener>> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

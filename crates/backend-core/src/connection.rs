use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;

use crate::{
    channel::ConnectionEvents,
    error::BackendError,
    state_machine::ConnectionState,
    types::{Channel, Message, Reaction},
};

/// Capability contract implemented by every backend connection.
///
/// `start` blocks for the lifetime of one session (connect, authenticate,
/// receive loop) and returns an error when the session ends; callers keep it
/// alive with [`crate::run_with_retry`]. Events are raised through
/// [`Connection::events`] on the task running `start`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Configured instance id, unique within the gateway.
    fn id(&self) -> &str;

    /// Backend family, for example `"mumble"` or `"matrix"`.
    fn provider(&self) -> &str;

    /// The gateway's own user id on this backend, once authenticated.
    fn user_id(&self) -> Option<String>;

    fn state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Latest full channel snapshot.
    fn channels(&self) -> Vec<Channel>;

    fn events(&self) -> &ConnectionEvents;

    /// Run one session: connect, authenticate, sync, then receive until the
    /// transport fails.
    async fn start(&self) -> Result<(), BackendError>;

    /// Send a message and return the backend-native id (empty when the
    /// backend assigns none).
    async fn send_message(
        &self,
        channel_id: &str,
        message: &Message,
    ) -> Result<String, BackendError>;

    /// Replace a previously sent message and return the id of the result.
    async fn update_message(
        &self,
        channel_id: &str,
        message_id: &str,
        message: &Message,
    ) -> Result<String, BackendError>;

    async fn send_reaction(
        &self,
        channel_id: &str,
        reaction: &Reaction,
    ) -> Result<String, BackendError>;

    /// Resolve a human channel name to its id; `NotFound` when unknown.
    async fn channel_id_from_name(&self, name: &str) -> Result<String, BackendError>;

    async fn set_channel_topic(&self, channel_id: &str, topic: &str) -> Result<(), BackendError>;
}

/// Non-owning back-reference from a message to the connection that produced it.
#[derive(Clone, Default)]
pub struct ConnectionHandle {
    inner: Option<Weak<dyn Connection>>,
}

impl ConnectionHandle {
    pub fn new(connection: Weak<dyn Connection>) -> Self {
        Self {
            inner: Some(connection),
        }
    }

    /// The originating connection, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<dyn Connection>> {
        self.inner.as_ref().and_then(Weak::upgrade)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(connection) => write!(f, "ConnectionHandle({})", connection.id()),
            None if self.inner.is_some() => f.write_str("ConnectionHandle(dropped)"),
            None => f.write_str("ConnectionHandle(detached)"),
        }
    }
}

//! Ordered message-handler chain fed by every connection's event hub.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use backend_core::{BackendError, Channel, Connection, ConnectionListener, Message, Reaction};
use futures::FutureExt;
use tracing::{debug, error, warn};

/// What the dispatcher does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Run the next handler in the chain.
    Continue,
    /// Skip the rest of the chain for this message.
    Stop,
}

/// One participant in the pipeline.
///
/// Only [`MessageHandler::handle`] takes part in the ordered, stoppable
/// chain. The lifecycle hooks are delivered to every handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, message: &Message) -> Result<HandlerOutcome, BackendError>;

    async fn on_connected(&self, _connection_id: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn on_channels_updated(
        &self,
        _connection_id: &str,
        _channels: &[Channel],
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn on_reaction(&self, _reaction: &Reaction) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Fans connection events through the handler chain.
///
/// Handler errors and panics are logged and treated as `Continue`; they
/// never reach the receive loop that raised the event.
pub struct Dispatcher {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Arc<Self> {
        Arc::new(Self { handlers })
    }

    /// Subscribe to the event hub of every connection.
    pub fn attach<'a>(self: &Arc<Self>, connections: impl IntoIterator<Item = &'a Arc<dyn Connection>>) {
        for connection in connections {
            connection.events().subscribe(self.clone());
            debug!(connection = %connection.id(), handlers = self.handlers.len(), "pipeline attached");
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Run the chain for one message; returns how many handlers ran.
    pub async fn dispatch(&self, message: &Message) -> usize {
        let mut ran = 0;
        for handler in &self.handlers {
            ran += 1;
            let outcome = isolate(handler.name(), "message", handler.handle(message))
                .await
                .unwrap_or(HandlerOutcome::Continue);
            if outcome == HandlerOutcome::Stop {
                debug!(
                    handler = handler.name(),
                    connection = %message.provider_instance,
                    channel_id = %message.channel_id,
                    "handler stopped the chain"
                );
                break;
            }
        }
        ran
    }
}

#[async_trait]
impl ConnectionListener for Dispatcher {
    async fn on_connected(&self, connection_id: &str) {
        for handler in &self.handlers {
            isolate(handler.name(), "connected", handler.on_connected(connection_id)).await;
        }
    }

    async fn on_message(&self, message: &Message) {
        self.dispatch(message).await;
    }

    async fn on_reaction(&self, reaction: &Reaction) {
        for handler in &self.handlers {
            isolate(handler.name(), "reaction", handler.on_reaction(reaction)).await;
        }
    }

    async fn on_channels_updated(&self, connection_id: &str, channels: &[Channel]) {
        for handler in &self.handlers {
            isolate(
                handler.name(),
                "channels_updated",
                handler.on_channels_updated(connection_id, channels),
            )
            .await;
        }
    }
}

/// Await one handler call, logging an error or panic instead of raising it.
async fn isolate<T, F>(handler: &str, event: &'static str, call: F) -> Option<T>
where
    F: Future<Output = Result<T, BackendError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(err)) => {
            warn!(handler, event, error = %err, "handler failed");
            None
        }
        Err(panic) => {
            error!(handler, event, panic = %panic_message(panic.as_ref()), "handler panicked");
            None
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use eventline_events::{Entry, Event};

use super::{ConsumeError, Consumer, Context};

/// Plain event handler.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Dispatches every event to every registered handler.
///
/// Handlers run per event in registration order. The first failing handler
/// aborts the batch; events and handlers before it have already been
/// applied, so handlers must tolerate redelivery.
#[derive(Default)]
pub struct DefaultConsumer {
    handlers: RwLock<Vec<(String, EventHandler)>>,
}

impl DefaultConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_handler<F>(self, name: impl Into<String>, handler: F) -> Result<Self, ConsumeError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(name, handler)?;
        Ok(self)
    }

    pub fn register<F>(&self, name: impl Into<String>, handler: F) -> Result<(), ConsumeError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = name.into();
        let mut handlers = self.handlers.write().map_err(|_| poisoned())?;
        debug!(handler = %name, registered = handlers.len() + 1, "event handler registered");
        handlers.push((name, Arc::new(handler)));
        Ok(())
    }

    pub fn handler_names(&self) -> Result<Vec<String>, ConsumeError> {
        let handlers = self.handlers.read().map_err(|_| poisoned())?;
        Ok(handlers.iter().map(|(name, _)| name.clone()).collect())
    }

    fn snapshot(&self) -> Result<Vec<(String, EventHandler)>, ConsumeError> {
        let handlers = self.handlers.read().map_err(|_| poisoned())?;
        Ok(handlers.clone())
    }
}

fn poisoned() -> ConsumeError {
    ConsumeError::Other("handler registry lock poisoned".to_string())
}

impl std::fmt::Debug for DefaultConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultConsumer")
            .field("handlers", &self.handler_names().ok())
            .finish()
    }
}

#[async_trait]
impl Consumer for DefaultConsumer {
    async fn handle(&self, _ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        let handlers = self.snapshot()?;
        if handlers.is_empty() {
            return Err(ConsumeError::NoHandlers);
        }

        for entry in entries {
            let event = entry.event();
            for (name, handler) in &handlers {
                handler(event).map_err(|source| ConsumeError::Handler {
                    handler: name.clone(),
                    event_name: event.name().to_string(),
                    event_id: event.id(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

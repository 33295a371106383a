//! Command execution pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Read the aggregate's stream
//!   ↓
//! 2. Build a fresh model and replay history
//!   ↓
//! 3. Execute the command (produces pending changes)
//!   ↓
//! 4. Append with the command's expected version
//!   ↓
//! 5. Run callbacks registered for the committed events
//! ```
//!
//! Models are built per execution by a factory and never shared, so the
//! service itself can serve any number of concurrent commands.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use eventline_events::{Batch, Change, Command, DomainModel, Entry, Event, Stream};

use crate::command_queue::{CommandError, CommandHandler};
use crate::event_store::{EventStore, EventStoreError};

/// Builds an empty model for one execution.
pub type ModelFactory<S> = Arc<dyn Fn() -> DomainModel<S> + Send + Sync>;

/// Runs after an append, once per committed entry it is registered for.
pub type Callback = Arc<dyn Fn(&Entry) -> anyhow::Result<()> + Send + Sync>;

pub struct CommandService<S> {
    store: Arc<dyn EventStore>,
    factory: ModelFactory<S>,
    // Keyed by event name or event id.
    callbacks: RwLock<HashMap<String, Callback>>,
}

impl<S> CommandService<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new<F>(store: Arc<dyn EventStore>, factory: F) -> Self
    where
        F: Fn() -> DomainModel<S> + Send + Sync + 'static,
    {
        Self {
            store,
            factory: Arc::new(factory),
            callbacks: RwLock::new(HashMap::new()),
        }
    }

    /// Execute one command and append its changes.
    ///
    /// Returns the committed entries; empty when the handler caused nothing.
    #[instrument(
        skip(self, command),
        fields(command = %command.name(), command_id = %command.id(), aggregate_id = %command.aggregate_id()),
        err
    )]
    pub async fn process(&self, command: &Command) -> Result<Vec<Entry>, CommandError> {
        let history = self
            .store
            .read(&[command.aggregate_id()])
            .await?
            .into_iter()
            .next()
            .map(Stream::into_events)
            .unwrap_or_default();

        let changes = {
            let mut model = (self.factory)();
            model.load(&history);
            model.execute(command)?
        };
        if changes.is_empty() {
            debug!("command caused no changes");
            return Ok(Vec::new());
        }

        let committed = self
            .store
            .append(vec![Change::new(
                command.aggregate_id(),
                command.expected_version(),
                changes,
            )])
            .await?;

        self.notify(&committed);
        Ok(committed)
    }

    /// Execute every command of `batch` and append all changes at once.
    ///
    /// Commands for the same aggregate run in batch order on one model; the
    /// first of them supplies the expected version. Any failure discards the
    /// whole batch.
    #[instrument(skip(self, batch), fields(batch_id = %batch.id(), commands = batch.len()), err)]
    pub async fn process_batch(&self, batch: &Batch) -> Result<Vec<Entry>, CommandError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut order: Vec<&str> = Vec::new();
        for command in batch.commands() {
            if !order.contains(&command.aggregate_id()) {
                order.push(command.aggregate_id());
            }
        }

        let mut histories: HashMap<String, Vec<Event>> = self
            .store
            .read(&order)
            .await?
            .into_iter()
            .map(|stream| (stream.name().to_string(), stream.into_events()))
            .collect();

        let changes = {
            let mut models: HashMap<&str, (u64, DomainModel<S>)> = HashMap::new();
            for command in batch.commands() {
                let id = command.aggregate_id();
                let (_, model) = models.entry(id).or_insert_with(|| {
                    let mut model = (self.factory)();
                    model.load(&histories.remove(id).unwrap_or_default());
                    (command.expected_version(), model)
                });
                model.execute(command)?;
            }

            order
                .iter()
                .filter_map(|id| {
                    let (expected, mut model) = models.remove(id)?;
                    let events = model.take_changes();
                    (!events.is_empty()).then(|| Change::new(*id, expected, events))
                })
                .collect::<Vec<_>>()
        };
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let committed = self.store.append(changes).await?;
        self.notify(&committed);
        Ok(committed)
    }

    /// Run `callback` for every committed event whose name or id equals `key`.
    ///
    /// Replaces any callback registered under the same key.
    pub fn register<F>(&self, key: impl Into<String>, callback: F) -> Result<(), CommandError>
    where
        F: Fn(&Entry) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.write().map_err(|_| poisoned())?;
        callbacks.insert(key.into(), Arc::new(callback));
        Ok(())
    }

    /// Returns whether a callback was registered under `key`.
    pub fn unregister(&self, key: &str) -> Result<bool, CommandError> {
        let mut callbacks = self.callbacks.write().map_err(|_| poisoned())?;
        Ok(callbacks.remove(key).is_some())
    }

    // The append is committed by now, so a broken registry is only logged.
    fn notify(&self, committed: &[Entry]) {
        let callbacks = match self.callbacks.read() {
            Ok(callbacks) => callbacks,
            Err(_) => {
                warn!(committed = committed.len(), "callback registry lock poisoned; callbacks skipped");
                return;
            }
        };
        if callbacks.is_empty() {
            return;
        }

        for entry in committed {
            let event = entry.event();
            let by_id = callbacks.get(&event.id().to_string());
            let by_name = callbacks.get(event.name());
            for callback in by_id.into_iter().chain(by_name) {
                if let Err(err) = callback(entry) {
                    warn!(
                        event = %event.name(),
                        event_id = %event.id(),
                        global_pos = entry.global_pos(),
                        error = %err,
                        "callback failed"
                    );
                }
            }
        }
    }
}

fn poisoned() -> CommandError {
    CommandError::Store(EventStoreError::Storage(
        "callback registry lock poisoned".to_string(),
    ))
}

impl<S> std::fmt::Debug for CommandService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let callbacks = self.callbacks.read().map(|c| c.len()).unwrap_or_default();
        f.debug_struct("CommandService")
            .field("callbacks", &callbacks)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S> CommandHandler for CommandService<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn handle(&self, command: Command) -> Result<(), CommandError> {
        self.process(&command).await.map(|_| ())
    }
}

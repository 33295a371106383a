//! Consumer pipeline.
//!
//! Subscriptions hand batches of entries to a [`Consumer`]. Consumers compose:
//! a [`Pipe`] runs stages in sequence, a [`TracingFilter`] opens a span per
//! entry, a [`ConcurrentFilter`] decouples delivery from processing and a
//! [`DefaultConsumer`] dispatches events to plain handler functions.
//!
//! An [`Inbox`] parks delivered batches until a worker receives and acks them;
//! [`InMemoryInbox`] is also a consumer and can end a pipeline.

pub mod concurrent;
pub mod default;
pub mod inbox;
pub mod pipe;
pub mod tracing_filter;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use eventline_core::{BatchId, EventId};
use eventline_events::Entry;

pub use concurrent::ConcurrentFilter;
pub use default::{DefaultConsumer, EventHandler};
pub use inbox::{InMemoryInbox, Inbox, InboxBatch, NoopInbox};
pub use pipe::Pipe;
pub use tracing_filter::TracingFilter;

/// Called with entries that were processed successfully.
pub type AckFn = Arc<dyn Fn(&[Entry]) + Send + Sync>;

/// Called with entries that failed or will not be processed.
pub type NackFn = Arc<dyn Fn(&[Entry]) + Send + Sync>;

/// Consumer failure.
#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error("no handlers registered")]
    NoHandlers,

    #[error("handler '{handler}' failed on event {event_id} ({event_name}): {source}")]
    Handler {
        handler: String,
        event_name: String,
        event_id: EventId,
        #[source]
        source: anyhow::Error,
    },

    #[error("consumer stopped")]
    Stopped,

    #[error("consumption cancelled")]
    Cancelled,

    #[error("unknown inbox batch {0}")]
    UnknownBatch(BatchId),

    #[error("{0}")]
    Other(String),
}

/// Receives batches of entries in global order.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError>;
}

#[async_trait]
impl<C> Consumer for Arc<C>
where
    C: Consumer + ?Sized,
{
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        (**self).handle(ctx, entries).await
    }
}

/// Cancellation signal shared by a subscription and everything it feeds.
#[derive(Debug, Clone)]
pub struct CancelScope {
    receiver: watch::Receiver<bool>,
}

impl CancelScope {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// A scope nobody can cancel.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self::new(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the scope is cancelled; never resolves otherwise.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        if receiver.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Lightweight view of one event in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: EventId,
    pub msg_type: String,
    pub data: Vec<u8>,
}

impl From<&Entry> for Message {
    fn from(entry: &Entry) -> Self {
        let event = entry.event();
        Self {
            id: event.id(),
            msg_type: event.name().to_string(),
            data: event.payload().to_vec(),
        }
    }
}

/// What a consumer knows about the batch it is handling.
#[derive(Debug, Clone)]
pub struct Context {
    subscription_id: String,
    scope: CancelScope,
    messages: Vec<Message>,
}

impl Context {
    pub fn new(subscription_id: impl Into<String>, scope: CancelScope, entries: &[Entry]) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            scope,
            messages: entries.iter().map(Message::from).collect(),
        }
    }

    /// Context for a sub-batch: same subscription, same cancellation scope.
    pub fn with_entries(&self, entries: &[Entry]) -> Self {
        Self::new(self.subscription_id.clone(), self.scope.clone(), entries)
    }

    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn scope(&self) -> &CancelScope {
        &self.scope
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }
}

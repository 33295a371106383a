//! Inbox: park delivered entries and process them later.
//!
//! A subscription hands its batches to an [`Inbox`] instead of a projection.
//! Workers pull queued batches with [`Inbox::receive_entries`], which hands
//! out a batch id, and confirm them with [`Inbox::ack_entries`]. A received
//! batch stays pending until every entry in it is acked.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::debug;

use eventline_core::{BatchId, EventId};
use eventline_events::Entry;

use super::{ConsumeError, Consumer, Context};

/// Queued batches per subscription before `queue_entries` waits.
pub const DEFAULT_INBOX_CAPACITY: usize = 128;

/// A batch handed out by [`Inbox::receive_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboxBatch {
    pub id: BatchId,
    pub subscription_id: String,
    /// When the subscription delivered the entries.
    pub noticed_at: DateTime<Utc>,
    pub entries: Vec<Entry>,
}

/// Durable hand-off between delivery and processing.
#[async_trait]
pub trait Inbox: Send + Sync {
    /// Queue `entries` for the subscription of `ctx`.
    async fn queue_entries(
        &self,
        ctx: &Context,
        noticed_at: DateTime<Utc>,
        entries: &[Entry],
    ) -> Result<(), ConsumeError>;

    /// Oldest queued batch of `subscription_id`, or `None` when nothing is queued.
    async fn receive_entries(&self, subscription_id: &str) -> Result<Option<InboxBatch>, ConsumeError>;

    /// Confirm entries of a received batch. An empty `entry_ids` confirms all of them.
    async fn ack_entries(&self, batch_id: BatchId, entry_ids: &[EventId]) -> Result<(), ConsumeError>;
}

#[async_trait]
impl<I> Inbox for Arc<I>
where
    I: Inbox + ?Sized,
{
    async fn queue_entries(
        &self,
        ctx: &Context,
        noticed_at: DateTime<Utc>,
        entries: &[Entry],
    ) -> Result<(), ConsumeError> {
        (**self).queue_entries(ctx, noticed_at, entries).await
    }

    async fn receive_entries(&self, subscription_id: &str) -> Result<Option<InboxBatch>, ConsumeError> {
        (**self).receive_entries(subscription_id).await
    }

    async fn ack_entries(&self, batch_id: BatchId, entry_ids: &[EventId]) -> Result<(), ConsumeError> {
        (**self).ack_entries(batch_id, entry_ids).await
    }
}

/// Accepts everything, stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInbox;

#[async_trait]
impl Inbox for NoopInbox {
    async fn queue_entries(
        &self,
        _ctx: &Context,
        _noticed_at: DateTime<Utc>,
        _entries: &[Entry],
    ) -> Result<(), ConsumeError> {
        Ok(())
    }

    async fn receive_entries(&self, _subscription_id: &str) -> Result<Option<InboxBatch>, ConsumeError> {
        Ok(None)
    }

    async fn ack_entries(&self, _batch_id: BatchId, _entry_ids: &[EventId]) -> Result<(), ConsumeError> {
        Ok(())
    }
}

struct Queued {
    noticed_at: DateTime<Utc>,
    entries: Vec<Entry>,
}

struct Queue {
    sender: mpsc::Sender<Queued>,
    receiver: mpsc::Receiver<Queued>,
}

/// Volatile inbox with one bounded queue per subscription.
///
/// Also a [`Consumer`], so it can sit at the end of a subscription's
/// pipeline. Queueing into a full queue waits until a batch is received or
/// the subscription is cancelled.
pub struct InMemoryInbox {
    capacity: usize,
    queues: Mutex<HashMap<String, Queue>>,
    // Received but not yet fully acked, keyed by batch id.
    pending: Mutex<HashMap<BatchId, VecDeque<Entry>>>,
}

impl Default for InMemoryInbox {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }
}

impl InMemoryInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// `capacity` batches per subscription; at least one.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Number of received batches still waiting for acks.
    pub fn pending_batches(&self) -> Result<usize, ConsumeError> {
        Ok(self.lock_pending()?.len())
    }

    /// Entries of `batch_id` that are not acked yet.
    pub fn pending_entries(&self, batch_id: BatchId) -> Result<Vec<Entry>, ConsumeError> {
        Ok(self
            .lock_pending()?
            .get(&batch_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn sender(&self, subscription_id: &str) -> Result<mpsc::Sender<Queued>, ConsumeError> {
        let mut queues = self.lock_queues()?;
        let queue = queues.entry(subscription_id.to_string()).or_insert_with(|| {
            let (sender, receiver) = mpsc::channel(self.capacity);
            Queue { sender, receiver }
        });
        Ok(queue.sender.clone())
    }

    fn lock_queues(&self) -> Result<MutexGuard<'_, HashMap<String, Queue>>, ConsumeError> {
        self.queues
            .lock()
            .map_err(|_| ConsumeError::Other("inbox queue lock poisoned".to_string()))
    }

    fn lock_pending(&self) -> Result<MutexGuard<'_, HashMap<BatchId, VecDeque<Entry>>>, ConsumeError> {
        self.pending
            .lock()
            .map_err(|_| ConsumeError::Other("inbox pending lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for InMemoryInbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryInbox")
            .field("capacity", &self.capacity)
            .field("pending_batches", &self.pending_batches().ok())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Inbox for InMemoryInbox {
    async fn queue_entries(
        &self,
        ctx: &Context,
        noticed_at: DateTime<Utc>,
        entries: &[Entry],
    ) -> Result<(), ConsumeError> {
        let sender = self.sender(ctx.subscription_id())?;
        let queued = Queued {
            noticed_at,
            entries: entries.to_vec(),
        };

        tokio::select! {
            biased;
            _ = ctx.scope().cancelled() => Err(ConsumeError::Cancelled),
            sent = sender.send(queued) => {
                sent.map_err(|_| ConsumeError::Stopped)?;
                debug!(subscription = %ctx.subscription_id(), count = entries.len(), "entries queued");
                Ok(())
            }
        }
    }

    async fn receive_entries(&self, subscription_id: &str) -> Result<Option<InboxBatch>, ConsumeError> {
        let queued = {
            let mut queues = self.lock_queues()?;
            match queues.get_mut(subscription_id) {
                Some(queue) => queue.receiver.try_recv().ok(),
                None => None,
            }
        };
        let Some(queued) = queued else {
            debug!(subscription = %subscription_id, "no entries");
            return Ok(None);
        };

        let id = BatchId::new();
        self.lock_pending()?
            .insert(id, queued.entries.iter().cloned().collect());
        debug!(subscription = %subscription_id, batch = %id, count = queued.entries.len(), "entries received");

        Ok(Some(InboxBatch {
            id,
            subscription_id: subscription_id.to_string(),
            noticed_at: queued.noticed_at,
            entries: queued.entries,
        }))
    }

    async fn ack_entries(&self, batch_id: BatchId, entry_ids: &[EventId]) -> Result<(), ConsumeError> {
        let mut pending = self.lock_pending()?;
        let Some(entries) = pending.get_mut(&batch_id) else {
            return Err(ConsumeError::UnknownBatch(batch_id));
        };

        if entry_ids.is_empty() {
            entries.clear();
        } else {
            entries.retain(|entry| !entry_ids.contains(&entry.event().id()));
        }
        if entries.is_empty() {
            pending.remove(&batch_id);
            debug!(batch = %batch_id, "batch acked");
        }
        Ok(())
    }
}

#[async_trait]
impl Consumer for InMemoryInbox {
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        self.queue_entries(ctx, Utc::now(), entries).await
    }
}

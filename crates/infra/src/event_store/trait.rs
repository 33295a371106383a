use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use eventline_events::{Change, Entry, Stream};

use super::subscription::Subscription;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency, configuration)
/// as opposed to domain errors raised by command handlers.
///
/// ## Error Categories
///
/// - **ConcurrentChange**: optimistic concurrency check failed; re-read and retry
/// - **ReadStreamsFailed**: the backend could not read or decode events
/// - **Misconfiguration**: the store was set up in a way that cannot serve the call
/// - **Storage**: any other backend failure (connection, lock poisoning, ...)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventStoreError {
    #[error("concurrent change on stream '{stream}': expected version {expected}, actual {actual}")]
    ConcurrentChange {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("reading streams failed: {0}")]
    ReadStreamsFailed(String),

    #[error("misconfiguration: {0}")]
    Misconfiguration(String),

    #[error("storage failure: {0}")]
    Storage(String),
}

impl EventStoreError {
    pub fn concurrent_change(stream: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::ConcurrentChange {
            stream: stream.into(),
            expected,
            actual,
        }
    }

    /// Stable numeric code of this error.
    pub fn code(&self) -> u32 {
        match self {
            EventStoreError::ReadStreamsFailed(_) => 9101,
            EventStoreError::ConcurrentChange { .. } => 9102,
            EventStoreError::Misconfiguration(_) => 9103,
            EventStoreError::Storage(_) => 9104,
        }
    }

    /// Conflicts are ordinary outcomes: re-read the stream and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventStoreError::ConcurrentChange { .. })
    }
}

/// Append-only event store.
///
/// Events live in named **streams** (one per aggregate instance). Every
/// appended event additionally receives a **global position** that is unique
/// across all streams and strictly increasing in commit order.
///
/// ## Append Semantics
///
/// `append()`:
/// - checks, for every change, that `expected_version` equals the stream's
///   current length (earlier changes of the same call included)
/// - fails with `ConcurrentChange` on the first mismatch and leaves **all**
///   streams untouched (all-or-nothing across the whole call)
/// - assigns global positions and returns the committed entries in position order
///
/// ## Read Semantics
///
/// `read()` / `read_at()` return the requested streams in request order.
/// Streams without events are omitted rather than reported as errors.
/// `read_at(t, ..)` only includes events that occurred strictly before `t`.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, changes: Vec<Change>) -> Result<Vec<Entry>, EventStoreError>;

    async fn read(&self, streams: &[&str]) -> Result<Vec<Stream>, EventStoreError>;

    async fn read_at(
        &self,
        at: DateTime<Utc>,
        streams: &[&str],
    ) -> Result<Vec<Stream>, EventStoreError>;
}

/// Batch delivery of entries in global order.
///
/// Every call is a single-shot fetch: the returned [`Subscription`] yields one
/// batch of at most `limit` entries (`0` = unlimited) and completes. Callers
/// poll by calling again with a new offset.
pub trait Transport: Send + Sync {
    /// Entries from the beginning of the log.
    fn subscribe(&self, limit: usize) -> Subscription {
        self.subscribe_with_offset(0, limit)
    }

    /// Entries with `global_pos >= offset`.
    fn subscribe_with_offset(&self, offset: u64, limit: usize) -> Subscription;

    /// Entries after a cursor the store keeps for `id`.
    ///
    /// The cursor advances past every delivered batch, so consecutive calls
    /// never repeat entries.
    fn subscribe_with_id(&self, id: &str, limit: usize) -> Subscription;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(&self, changes: Vec<Change>) -> Result<Vec<Entry>, EventStoreError> {
        (**self).append(changes).await
    }

    async fn read(&self, streams: &[&str]) -> Result<Vec<Stream>, EventStoreError> {
        (**self).read(streams).await
    }

    async fn read_at(
        &self,
        at: DateTime<Utc>,
        streams: &[&str],
    ) -> Result<Vec<Stream>, EventStoreError> {
        (**self).read_at(at, streams).await
    }
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn subscribe_with_offset(&self, offset: u64, limit: usize) -> Subscription {
        (**self).subscribe_with_offset(offset, limit)
    }

    fn subscribe_with_id(&self, id: &str, limit: usize) -> Subscription {
        (**self).subscribe_with_id(id, limit)
    }
}

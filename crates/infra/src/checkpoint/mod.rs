//! Subscription checkpoints.
//!
//! A checkpoint remembers the next global position a subscription has to
//! read. It only ever moves forward.

pub mod in_memory;
pub mod postgres;

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use eventline_events::Entry;

use crate::event_store::EventStoreError;

pub use in_memory::InMemoryCheckpointStore;
pub use postgres::PostgresCheckpointStore;

/// Position of one subscription in the global log.
///
/// Shared between the polling task and whoever inspects progress; all
/// updates are atomic.
#[derive(Debug)]
pub struct Checkpoint {
    id: String,
    position: AtomicU64,
    // Nanoseconds since the epoch.
    last_seen_at: AtomicI64,
}

impl Checkpoint {
    /// A checkpoint at position 0.
    pub fn new(id: impl Into<String>) -> Self {
        Self::restore(id, 0, Utc::now())
    }

    pub fn with_position(id: impl Into<String>, position: u64) -> Self {
        Self::restore(id, position, Utc::now())
    }

    /// Rebuild a checkpoint from persisted values.
    pub fn restore(id: impl Into<String>, position: u64, last_seen_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            position: AtomicU64::new(position),
            last_seen_at: AtomicI64::new(nanos(last_seen_at)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn last_seen_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.last_seen_at.load(Ordering::Acquire))
    }

    /// Move to `position` unless the checkpoint is already further ahead.
    ///
    /// Returns the resulting position.
    pub fn update(&self, position: u64) -> u64 {
        let previous = self.position.fetch_max(position, Ordering::AcqRel);
        self.last_seen_at.store(nanos(Utc::now()), Ordering::Release);
        previous.max(position)
    }

    /// Position following the highest entry in `entries`.
    pub fn next_position(&self, entries: &[Entry]) -> u64 {
        entries
            .iter()
            .map(Entry::global_pos)
            .max()
            .map_or_else(|| self.position(), |max| max + 1)
    }
}

impl Clone for Checkpoint {
    fn clone(&self) -> Self {
        Self::restore(self.id.clone(), self.position(), self.last_seen_at())
    }
}

fn nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Durable home of checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The stored checkpoint for `id`, or a fresh one at position 0.
    async fn get_latest_checkpoint(&self, id: &str) -> Result<Checkpoint, EventStoreError>;

    /// Insert or replace the stored checkpoint.
    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EventStoreError>;
}

#[async_trait]
impl<S> CheckpointStore for std::sync::Arc<S>
where
    S: CheckpointStore + ?Sized,
{
    async fn get_latest_checkpoint(&self, id: &str) -> Result<Checkpoint, EventStoreError> {
        (**self).get_latest_checkpoint(id).await
    }

    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EventStoreError> {
        (**self).store_checkpoint(checkpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_events::Event;
    use proptest::prelude::*;

    fn entries(positions: &[u64]) -> Vec<Entry> {
        positions
            .iter()
            .map(|&p| Entry::new(p, Event::new("e", "s", Vec::new())))
            .collect()
    }

    #[test]
    fn next_position_follows_the_highest_entry() {
        let cp = Checkpoint::with_position("sub", 10);
        assert_eq!(cp.next_position(&entries(&[10, 12, 11])), 13);
        assert_eq!(cp.next_position(&[]), 10);
    }

    #[test]
    fn update_never_moves_backwards() {
        let cp = Checkpoint::new("sub");
        assert_eq!(cp.update(5), 5);
        assert_eq!(cp.update(3), 5);
        assert_eq!(cp.position(), 5);
    }

    #[test]
    fn update_refreshes_last_seen() {
        let long_ago = DateTime::from_timestamp_nanos(0);
        let cp = Checkpoint::restore("sub", 0, long_ago);
        cp.update(1);
        assert!(cp.last_seen_at() > long_ago);
    }

    #[test]
    fn restore_keeps_nanoseconds() {
        let at = DateTime::from_timestamp_nanos(1_700_000_000_123_456_789);
        let cp = Checkpoint::restore("sub", 4, at);
        assert_eq!(cp.last_seen_at(), at);
        assert_eq!(cp.clone().last_seen_at(), at);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]

        #[test]
        fn position_is_the_running_maximum(updates in prop::collection::vec(0u64..10_000, 0..50)) {
            let cp = Checkpoint::new("sub");
            for &u in &updates {
                cp.update(u);
            }
            prop_assert_eq!(cp.position(), updates.iter().copied().max().unwrap_or(0));
        }
    }
}

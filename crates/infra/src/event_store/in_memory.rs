use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use eventline_events::{Change, Entry, Event, Stream};

use super::r#trait::{EventStore, EventStoreError, Transport};
use super::subscription::Subscription;

#[derive(Debug, Default)]
struct Log {
    /// Every entry ever appended; the index is the global position.
    entries: Vec<Entry>,
    /// Stream name → indexes into `entries`, in stream order.
    streams: HashMap<String, Vec<usize>>,
    /// Subscriber id → next position to deliver.
    cursors: HashMap<String, u64>,
}

impl Log {
    fn version_of(&self, stream: &str) -> u64 {
        self.streams.get(stream).map_or(0, |idx| idx.len() as u64)
    }

    fn batch(&self, offset: u64, limit: usize) -> Vec<Entry> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(self.entries.len());
        let end = if limit == 0 {
            self.entries.len()
        } else {
            start.saturating_add(limit).min(self.entries.len())
        };
        self.entries[start..end].to_vec()
    }

    fn stream_events(&self, stream: &str, include: impl Fn(&Event) -> bool) -> Vec<Event> {
        self.streams
            .get(stream)
            .map(|idx| {
                idx.iter()
                    .map(|&i| self.entries[i].event())
                    .filter(|e| include(*e))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory append-only event store and transport.
///
/// One log behind one reader/writer lock. Global positions start at 0.
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in the log.
    pub fn len(&self) -> Result<usize, EventStoreError> {
        Ok(self.read_log()?.entries.len())
    }

    pub fn is_empty(&self) -> Result<bool, EventStoreError> {
        Ok(self.len()? == 0)
    }

    fn read_log(&self) -> Result<RwLockReadGuard<'_, Log>, EventStoreError> {
        self.log
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    fn write_log(&self) -> Result<RwLockWriteGuard<'_, Log>, EventStoreError> {
        self.log
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))
    }

    fn read_streams(
        &self,
        streams: &[&str],
        include: impl Fn(&Event) -> bool,
    ) -> Result<Vec<Stream>, EventStoreError> {
        let log = self.read_log()?;
        let mut seen = HashSet::new();
        let mut found = Vec::with_capacity(streams.len());

        for &name in streams {
            if !seen.insert(name) {
                continue;
            }
            let events = log.stream_events(name, &include);
            if !events.is_empty() {
                found.push(Stream::new(name, events));
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, changes: Vec<Change>) -> Result<Vec<Entry>, EventStoreError> {
        let mut log = self.write_log()?;

        // Validate everything before touching the log.
        {
            let mut versions: HashMap<&str, u64> = HashMap::new();
            for change in &changes {
                let current = versions
                    .get(change.stream.as_str())
                    .copied()
                    .unwrap_or_else(|| log.version_of(&change.stream));
                if current != change.expected_version {
                    return Err(EventStoreError::concurrent_change(
                        &change.stream,
                        change.expected_version,
                        current,
                    ));
                }
                versions.insert(change.stream.as_str(), change.resulting_version());
            }
        }

        let mut committed = Vec::new();
        for change in changes {
            for event in change.events {
                let position = log.entries.len();
                let entry = Entry::new(position as u64, event);
                log.entries.push(entry.clone());
                log.streams.entry(change.stream.clone()).or_default().push(position);
                committed.push(entry);
            }
        }

        debug!(committed = committed.len(), log_len = log.entries.len(), "append committed");
        Ok(committed)
    }

    async fn read(&self, streams: &[&str]) -> Result<Vec<Stream>, EventStoreError> {
        self.read_streams(streams, |_| true)
    }

    async fn read_at(
        &self,
        at: DateTime<Utc>,
        streams: &[&str],
    ) -> Result<Vec<Stream>, EventStoreError> {
        self.read_streams(streams, |e| e.occurred_at() < at)
    }
}

impl Transport for InMemoryEventStore {
    fn subscribe_with_offset(&self, offset: u64, limit: usize) -> Subscription {
        Subscription::ready(self.read_log().map(|log| log.batch(offset, limit)))
    }

    fn subscribe_with_id(&self, id: &str, limit: usize) -> Subscription {
        let result = self.write_log().map(|mut log| {
            let offset = log.cursors.get(id).copied().unwrap_or(0);
            let batch = log.batch(offset, limit);
            if let Some(last) = batch.last() {
                log.cursors.insert(id.to_string(), last.global_pos() + 1);
            }
            batch
        });
        Subscription::ready(result)
    }
}

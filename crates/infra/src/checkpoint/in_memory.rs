use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Checkpoint, CheckpointStore};
use crate::event_store::EventStoreError;

/// Checkpoints kept in a map. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, (u64, DateTime<Utc>)>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_latest_checkpoint(&self, id: &str) -> Result<Checkpoint, EventStoreError> {
        let checkpoints = self
            .checkpoints
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(match checkpoints.get(id) {
            Some(&(position, last_seen_at)) => Checkpoint::restore(id, position, last_seen_at),
            None => Checkpoint::new(id),
        })
    }

    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EventStoreError> {
        let mut checkpoints = self
            .checkpoints
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        let stored = checkpoints
            .entry(checkpoint.id().to_string())
            .or_insert((0, checkpoint.last_seen_at()));
        // A slower writer must not rewind the stored position.
        stored.0 = stored.0.max(checkpoint.position());
        stored.1 = checkpoint.last_seen_at();
        Ok(())
    }
}

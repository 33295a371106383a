use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use eventline_events::event::{format_timestamp, parse_timestamp};

use super::{Checkpoint, CheckpointStore};
use crate::event_store::postgres::map_sqlx_error;
use crate::event_store::schema;
use crate::event_store::EventStoreError;

/// Postgres-backed checkpoint store (`checkpoints` table).
#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn install_schema(&self) -> Result<(), EventStoreError> {
        schema::install(&self.pool, schema::CHECKPOINT_CHANGES).await
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), err)]
    async fn get_latest_checkpoint(&self, id: &str) -> Result<Checkpoint, EventStoreError> {
        let row = sqlx::query(
            r#"
            SELECT global_position, last_seen_at
            FROM checkpoints
            WHERE subscription_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_latest_checkpoint", e))?;

        let Some(row) = row else {
            return Ok(Checkpoint::new(id));
        };

        let position: i64 = row
            .try_get("global_position")
            .map_err(|e| map_sqlx_error("get_latest_checkpoint", e))?;
        let last_seen_at: String = row
            .try_get("last_seen_at")
            .map_err(|e| map_sqlx_error("get_latest_checkpoint", e))?;
        let last_seen_at = parse_timestamp(&last_seen_at).map_err(|e| {
            EventStoreError::Storage(format!("invalid last_seen_at '{last_seen_at}' for {id}: {e}"))
        })?;

        Ok(Checkpoint::restore(id, position.max(0) as u64, last_seen_at))
    }

    #[instrument(skip(self, checkpoint), fields(id = checkpoint.id(), position = checkpoint.position()), err)]
    async fn store_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), EventStoreError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (subscription_id, global_position, last_seen_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (subscription_id)
            DO UPDATE SET
                global_position = GREATEST(checkpoints.global_position, EXCLUDED.global_position),
                last_seen_at = EXCLUDED.last_seen_at
            "#,
        )
        .bind(checkpoint.id())
        .bind(i64::try_from(checkpoint.position()).unwrap_or(i64::MAX))
        .bind(format_timestamp(&checkpoint.last_seen_at()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("store_checkpoint", e))?;

        Ok(())
    }
}

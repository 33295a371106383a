//! Postgres schema installation.
//!
//! Schema changes are grouped into named change sets. Each set is applied at
//! most once, inside its own transaction, and recorded in the `changes` table.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, info, instrument};

use eventline_events::event::format_timestamp;

use super::postgres::map_sqlx_error;
use super::r#trait::EventStoreError;

/// A named, ordered list of DDL statements.
#[derive(Debug, Clone, Copy)]
pub struct ChangeSet {
    pub id: &'static str,
    pub statements: &'static [&'static str],
}

/// Tables backing `PostgresEventStore`.
pub const EVENT_STORE_CHANGES: &[ChangeSet] = &[
    ChangeSet {
        id: "2024-01-07-001_create_events",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS events (
                global_position   BIGINT GENERATED ALWAYS AS IDENTITY,
                stream_name       VARCHAR(255) NOT NULL,
                stream_version    BIGINT NOT NULL,
                aggregate_id      VARCHAR(255) NOT NULL,
                event_id          UUID NOT NULL,
                event_kind        VARCHAR(16) NOT NULL,
                event_name        VARCHAR(255) NOT NULL,
                event_occurred_at VARCHAR(35) NOT NULL,
                event             BYTEA NOT NULL,
                CONSTRAINT pk_events PRIMARY KEY (stream_name, stream_version),
                CONSTRAINT uq_events_global_position UNIQUE (global_position)
            )
            "#,
        ],
    },
    ChangeSet {
        id: "2024-01-07-002_create_subscription_cursors",
        statements: &[
            r#"
            CREATE TABLE IF NOT EXISTS subscription_cursors (
                subscription_id VARCHAR(255) PRIMARY KEY,
                global_position BIGINT NOT NULL
            )
            "#,
        ],
    },
];

/// Tables backing `PostgresCheckpointStore`.
pub const CHECKPOINT_CHANGES: &[ChangeSet] = &[ChangeSet {
    id: "2024-01-07-003_create_checkpoints",
    statements: &[
        r#"
        CREATE TABLE IF NOT EXISTS checkpoints (
            subscription_id VARCHAR(255) PRIMARY KEY,
            global_position BIGINT NOT NULL,
            last_seen_at    VARCHAR(35) NOT NULL
        )
        "#,
    ],
}];

const CREATE_CHANGES: &str = r#"
    CREATE TABLE IF NOT EXISTS changes (
        id         VARCHAR(128) PRIMARY KEY,
        applied_at VARCHAR(35) NOT NULL
    )
"#;

// Serializes concurrent installers.
const SCHEMA_LOCK_KEY: i64 = 0x6576_6c5f_7363_6865;

/// Apply every change set in `changes` that has not been applied yet.
#[instrument(skip(pool, changes), fields(change_sets = changes.len()), err)]
pub async fn install(pool: &PgPool, changes: &[ChangeSet]) -> Result<(), EventStoreError> {
    sqlx::query(CREATE_CHANGES)
        .execute(pool)
        .await
        .map_err(|e| map_sqlx_error("create_changes", e))?;

    for change in changes {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("schema_lock", e))?;

        let applied: Option<String> = sqlx::query_scalar("SELECT id FROM changes WHERE id = $1")
            .bind(change.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lookup_change", e))?;

        if applied.is_some() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            debug!(change = change.id, "change already applied");
            continue;
        }

        for statement in change.statements {
            sqlx::query(*statement)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(change.id, e))?;
        }

        sqlx::query("INSERT INTO changes (id, applied_at) VALUES ($1, $2)")
            .bind(change.id)
            .bind(format_timestamp(&Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_change", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        info!(change = change.id, "change applied");
    }

    info!("schema installation complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn change_set_ids_are_unique() {
        let mut ids = HashSet::new();
        for change in EVENT_STORE_CHANGES.iter().chain(CHECKPOINT_CHANGES) {
            assert!(ids.insert(change.id), "duplicate change set {}", change.id);
            assert!(!change.statements.is_empty());
        }
    }
}

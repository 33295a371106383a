//! Postgres-backed event store and transport.
//!
//! ## Insert Modes
//!
//! | mode | statement | notes |
//! |------|-----------|-------|
//! | `PerRow` | one `INSERT` per event | single-change appends only |
//! | `Batch` | multi-row `INSERT ... VALUES` | chunked to stay below the bind limit |
//! | `Bulk` | `INSERT ... SELECT FROM UNNEST(...)` | one statement, array binds |
//!
//! All modes run inside one transaction per `append` call and produce the same
//! ordering and conflict behaviour.
//!
//! ## Global Positions
//!
//! Positions come from the `global_position` identity column. Appends take a
//! transaction-scoped advisory lock, so transactions commit in the order
//! their identities were drawn and a subscriber never observes position `n+1`
//! before `n`. A rolled back append still consumes identity values, so
//! positions may have gaps; they are never reordered.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) during append | `23505` | `ConcurrentChange` |
//! | Database (unique violation) elsewhere | `23505` | `Storage` |
//! | Database (other) | any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |
//!
//! Read paths report failures as `ReadStreamsFailed`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgExecutor, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn, Span};
use uuid::Uuid;

use eventline_core::EventId;
use eventline_events::event::{format_timestamp, parse_timestamp};
use eventline_events::{Change, Entry, Event, EventKind, Stream};

use super::r#trait::{EventStore, EventStoreError, Transport};
use super::schema;
use super::subscription::Subscription;

/// How rows are written during `append`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum InsertMode {
    /// One statement per event.
    #[default]
    PerRow,
    /// Multi-row `VALUES` lists.
    Batch,
    /// `UNNEST` over array parameters.
    Bulk,
}

impl InsertMode {
    pub fn as_str(self) -> &'static str {
        match self {
            InsertMode::PerRow => "per-row",
            InsertMode::Batch => "batch",
            InsertMode::Bulk => "bulk",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "per-row" | "per_row" | "row" => Some(InsertMode::PerRow),
            "batch" => Some(InsertMode::Batch),
            "bulk" => Some(InsertMode::Bulk),
            _ => None,
        }
    }
}

const APPEND_LOCK_KEY: i64 = 0x6576_656e_746c_696e;

// 8 binds per row; Postgres allows 65535 binds per statement.
const BATCH_CHUNK_ROWS: usize = 4096;

const INSERT_COLUMNS: &str = "INSERT INTO events (stream_name, stream_version, aggregate_id, event_id, event_kind, event_name, event_occurred_at, event) ";

const INSERT_ONE: &str = r#"
    INSERT INTO events (stream_name, stream_version, aggregate_id, event_id, event_kind, event_name, event_occurred_at, event)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING global_position
"#;

const INSERT_UNNEST: &str = r#"
    INSERT INTO events (stream_name, stream_version, aggregate_id, event_id, event_kind, event_name, event_occurred_at, event)
    SELECT s, v, a, i, k, n, o, e
    FROM UNNEST(
        $1::varchar[], $2::bigint[], $3::varchar[], $4::uuid[],
        $5::varchar[], $6::varchar[], $7::varchar[], $8::bytea[]
    ) WITH ORDINALITY AS t(s, v, a, i, k, n, o, e, ord)
    ORDER BY ord
    RETURNING global_position, stream_name, stream_version
"#;

const SELECT_COLUMNS: &str = "global_position, stream_name, stream_version, aggregate_id, event_id, event_kind, event_name, event_occurred_at, event";

/// Postgres-backed append-only event store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
    mode: InsertMode,
}

impl PostgresEventStore {
    /// Create a store using per-row inserts.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            mode: InsertMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: InsertMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> InsertMode {
        self.mode
    }

    /// Create the tables this store needs (idempotent).
    pub async fn install_schema(&self) -> Result<(), EventStoreError> {
        schema::install(&self.pool, schema::EVENT_STORE_CHANGES).await
    }

    /// Append changes in one transaction with optimistic concurrency control.
    #[instrument(
        skip(self, changes),
        fields(changes = changes.len(), mode = self.mode.as_str(), committed = tracing::field::Empty),
        err
    )]
    pub async fn append_changes(&self, changes: Vec<Change>) -> Result<Vec<Entry>, EventStoreError> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        if changes.len() > 1 && self.mode == InsertMode::PerRow {
            return Err(EventStoreError::Misconfiguration(
                "appending several changes at once requires batch or bulk insert mode".to_string(),
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("append_lock", e))?;

        let mut versions: HashMap<&str, u64> = HashMap::new();
        let mut rows: Vec<PendingRow<'_>> = Vec::new();
        for change in &changes {
            let current = match versions.get(change.stream.as_str()) {
                Some(v) => *v,
                None => stream_version(&mut *tx, &change.stream).await?,
            };
            if current != change.expected_version {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(EventStoreError::concurrent_change(
                    &change.stream,
                    change.expected_version,
                    current,
                ));
            }
            for (offset, event) in change.events.iter().enumerate() {
                rows.push(PendingRow {
                    stream: &change.stream,
                    version: current + offset as u64 + 1,
                    event,
                });
            }
            versions.insert(change.stream.as_str(), change.resulting_version());
        }

        let inserted = match self.mode {
            InsertMode::PerRow => insert_per_row(&mut tx, &rows).await,
            InsertMode::Batch => insert_batch(&mut tx, &rows).await,
            InsertMode::Bulk => insert_bulk(&mut tx, &rows).await,
        };
        let positions = match inserted {
            Ok(positions) => positions,
            Err(InsertFailure::Store(err)) => return Err(err),
            Err(InsertFailure::Conflict) => {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                return Err(self.describe_conflict(&changes).await);
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        let mut committed: Vec<Entry> = rows
            .iter()
            .zip(positions)
            .map(|(row, pos)| Entry::new(pos, row.event.clone()))
            .collect();
        committed.sort_by_key(Entry::global_pos);

        Span::current().record("committed", committed.len());
        Ok(committed)
    }

    /// Build the conflict error for an insert that hit an existing version.
    ///
    /// The failed transaction cannot be queried any more, so the versions
    /// are re-read from the pool.
    async fn describe_conflict(&self, changes: &[Change]) -> EventStoreError {
        let mut current: HashMap<&str, u64> = HashMap::new();
        for change in changes {
            if current.contains_key(change.stream.as_str()) {
                continue;
            }
            match stream_version(&*self.pool, &change.stream).await {
                Ok(version) => {
                    current.insert(change.stream.as_str(), version);
                }
                Err(err) => warn!(stream = %change.stream, error = %err, "re-reading stream version failed"),
            }
        }
        conflict_for(changes, &current)
    }

    #[instrument(skip(self, streams), fields(streams = streams.len(), before = ?before), err)]
    async fn read_streams(
        &self,
        streams: &[&str],
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Stream>, EventStoreError> {
        let mut names: Vec<String> = Vec::with_capacity(streams.len());
        for &name in streams {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }

        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM events \
             WHERE stream_name = ANY($1) AND ($2::varchar IS NULL OR event_occurred_at < $2) \
             ORDER BY stream_name, stream_version"
        );
        let rows = sqlx::query(&sql)
            .bind(names.as_slice())
            .bind(before.map(|at| format_timestamp(&at)))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| EventStoreError::ReadStreamsFailed(format!("{}: {e}", names.join(","))))?;

        let mut grouped: HashMap<String, Vec<Event>> = HashMap::new();
        for row in rows {
            let row = EventRow::from_row(&row)
                .map_err(|e| EventStoreError::ReadStreamsFailed(format!("failed to decode event row: {e}")))?;
            let stream = row.stream_name.clone();
            let entry = Entry::try_from(row)?;
            grouped.entry(stream).or_default().push(entry.into_event());
        }

        Ok(names
            .into_iter()
            .filter_map(|name| grouped.remove(&name).map(|events| Stream::new(name, events)))
            .collect())
    }

    fn spawn_fetch<F>(&self, fetch: F) -> Subscription
    where
        F: std::future::Future<Output = Result<Vec<Entry>, EventStoreError>> + Send + 'static,
    {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(h) => h,
            Err(_) => {
                return Subscription::ready(Err(EventStoreError::Misconfiguration(
                    "postgres subscriptions require a tokio runtime".to_string(),
                )));
            }
        };

        let (tx, rx) = oneshot::channel();
        handle.spawn(async move {
            let _ = tx.send(fetch.await);
        });
        Subscription::new(rx)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&self, changes: Vec<Change>) -> Result<Vec<Entry>, EventStoreError> {
        self.append_changes(changes).await
    }

    async fn read(&self, streams: &[&str]) -> Result<Vec<Stream>, EventStoreError> {
        self.read_streams(streams, None).await
    }

    async fn read_at(
        &self,
        at: DateTime<Utc>,
        streams: &[&str],
    ) -> Result<Vec<Stream>, EventStoreError> {
        self.read_streams(streams, Some(at)).await
    }
}

impl Transport for PostgresEventStore {
    fn subscribe_with_offset(&self, offset: u64, limit: usize) -> Subscription {
        let pool = self.pool.clone();
        self.spawn_fetch(async move { fetch_batch(&*pool, offset, limit).await })
    }

    fn subscribe_with_id(&self, id: &str, limit: usize) -> Subscription {
        let pool = self.pool.clone();
        let id = id.to_string();
        self.spawn_fetch(async move { fetch_batch_for(&pool, &id, limit).await })
    }
}

struct PendingRow<'a> {
    stream: &'a str,
    version: u64,
    event: &'a Event,
}

async fn stream_version<'e, E>(executor: E, stream: &str) -> Result<u64, EventStoreError>
where
    E: PgExecutor<'e>,
{
    let version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(stream_version), 0) FROM events WHERE stream_name = $1")
            .bind(stream)
            .fetch_one(executor)
            .await
            .map_err(|e| map_sqlx_error("stream_version", e))?;
    Ok(version as u64)
}

/// Why an insert statement failed.
enum InsertFailure {
    /// A row collided with an existing stream version.
    Conflict,
    Store(EventStoreError),
}

impl From<EventStoreError> for InsertFailure {
    fn from(err: EventStoreError) -> Self {
        InsertFailure::Store(err)
    }
}

/// The first stream whose current version differs from what its change
/// expected. Streams without a known version are skipped.
fn conflict_for(changes: &[Change], current: &HashMap<&str, u64>) -> EventStoreError {
    let mut checked: Vec<&str> = Vec::new();
    for change in changes {
        let stream = change.stream.as_str();
        // Later changes to the same stream build on the first one.
        if checked.contains(&stream) {
            continue;
        }
        checked.push(stream);
        if let Some(&actual) = current.get(stream) {
            if actual != change.expected_version {
                return EventStoreError::concurrent_change(stream, change.expected_version, actual);
            }
        }
    }

    // The competing write is gone again; report the first stream as it was expected.
    match changes.first() {
        Some(first) => EventStoreError::concurrent_change(
            &first.stream,
            first.expected_version,
            current
                .get(first.stream.as_str())
                .copied()
                .unwrap_or(first.expected_version),
        ),
        None => EventStoreError::Storage("conflict reported for an empty append".to_string()),
    }
}

async fn insert_per_row(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[PendingRow<'_>],
) -> Result<Vec<u64>, InsertFailure> {
    let mut positions = Vec::with_capacity(rows.len());
    for row in rows {
        let position: i64 = sqlx::query_scalar(INSERT_ONE)
            .bind(row.stream)
            .bind(row.version as i64)
            .bind(row.event.aggregate_id())
            .bind(Uuid::from(row.event.id()))
            .bind(row.event.kind().as_str())
            .bind(row.event.name())
            .bind(format_timestamp(&row.event.occurred_at()))
            .bind(row.event.payload())
            .fetch_one(&mut **tx)
            .await
            .map_err(insert_error)?;
        positions.push(position as u64);
    }
    debug!(rows = rows.len(), "per-row insert done");
    Ok(positions)
}

async fn insert_batch(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[PendingRow<'_>],
) -> Result<Vec<u64>, InsertFailure> {
    let mut by_key: HashMap<(String, i64), u64> = HashMap::with_capacity(rows.len());

    for chunk in rows.chunks(BATCH_CHUNK_ROWS) {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(INSERT_COLUMNS);
        qb.push_values(chunk, |mut b, row| {
            b.push_bind(row.stream.to_string())
                .push_bind(row.version as i64)
                .push_bind(row.event.aggregate_id().to_string())
                .push_bind(Uuid::from(row.event.id()))
                .push_bind(row.event.kind().as_str())
                .push_bind(row.event.name().to_string())
                .push_bind(format_timestamp(&row.event.occurred_at()))
                .push_bind(row.event.payload().to_vec());
        });
        qb.push(" RETURNING global_position, stream_name, stream_version");

        let returned = qb
            .build()
            .fetch_all(&mut **tx)
            .await
            .map_err(insert_error)?;
        collect_positions(&returned, &mut by_key)?;
    }

    debug!(rows = rows.len(), "batch insert done");
    Ok(positions_in_row_order(rows, &by_key)?)
}

async fn insert_bulk(
    tx: &mut Transaction<'_, Postgres>,
    rows: &[PendingRow<'_>],
) -> Result<Vec<u64>, InsertFailure> {
    let mut streams = Vec::with_capacity(rows.len());
    let mut versions = Vec::with_capacity(rows.len());
    let mut aggregate_ids = Vec::with_capacity(rows.len());
    let mut event_ids = Vec::with_capacity(rows.len());
    let mut kinds = Vec::with_capacity(rows.len());
    let mut names = Vec::with_capacity(rows.len());
    let mut occurred = Vec::with_capacity(rows.len());
    let mut payloads = Vec::with_capacity(rows.len());

    for row in rows {
        streams.push(row.stream.to_string());
        versions.push(row.version as i64);
        aggregate_ids.push(row.event.aggregate_id().to_string());
        event_ids.push(Uuid::from(row.event.id()));
        kinds.push(row.event.kind().as_str().to_string());
        names.push(row.event.name().to_string());
        occurred.push(format_timestamp(&row.event.occurred_at()));
        payloads.push(row.event.payload().to_vec());
    }

    let returned = sqlx::query(INSERT_UNNEST)
        .bind(streams)
        .bind(versions)
        .bind(aggregate_ids)
        .bind(event_ids)
        .bind(kinds)
        .bind(names)
        .bind(occurred)
        .bind(payloads)
        .fetch_all(&mut **tx)
        .await
        .map_err(insert_error)?;

    let mut by_key = HashMap::with_capacity(rows.len());
    collect_positions(&returned, &mut by_key)?;

    debug!(rows = rows.len(), "bulk insert done");
    Ok(positions_in_row_order(rows, &by_key)?)
}

fn collect_positions(
    returned: &[PgRow],
    by_key: &mut HashMap<(String, i64), u64>,
) -> Result<(), EventStoreError> {
    for r in returned {
        let position: i64 = r
            .try_get("global_position")
            .map_err(|e| map_sqlx_error("returning", e))?;
        let stream: String = r
            .try_get("stream_name")
            .map_err(|e| map_sqlx_error("returning", e))?;
        let version: i64 = r
            .try_get("stream_version")
            .map_err(|e| map_sqlx_error("returning", e))?;
        by_key.insert((stream, version), position as u64);
    }
    Ok(())
}

fn positions_in_row_order(
    rows: &[PendingRow<'_>],
    by_key: &HashMap<(String, i64), u64>,
) -> Result<Vec<u64>, EventStoreError> {
    rows.iter()
        .map(|row| {
            by_key
                .get(&(row.stream.to_string(), row.version as i64))
                .copied()
                .ok_or_else(|| {
                    EventStoreError::Storage(format!(
                        "insert returned no position for {}@{}",
                        row.stream, row.version
                    ))
                })
        })
        .collect()
}

async fn fetch_batch<'e, E>(executor: E, offset: u64, limit: usize) -> Result<Vec<Entry>, EventStoreError>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        "SELECT {SELECT_COLUMNS} FROM events WHERE global_position >= $1 ORDER BY global_position LIMIT $2"
    );
    // LIMIT NULL is LIMIT ALL.
    let limit = (limit > 0).then(|| i64::try_from(limit).unwrap_or(i64::MAX));
    let rows = sqlx::query(&sql)
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .bind(limit)
        .fetch_all(executor)
        .await
        .map_err(|e| EventStoreError::ReadStreamsFailed(format!("subscription fetch from {offset}: {e}")))?;

    rows.iter()
        .map(|row| {
            EventRow::from_row(row)
                .map_err(|e| EventStoreError::ReadStreamsFailed(format!("failed to decode event row: {e}")))
                .and_then(Entry::try_from)
        })
        .collect()
}

async fn fetch_batch_for(pool: &PgPool, id: &str, limit: usize) -> Result<Vec<Entry>, EventStoreError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| map_sqlx_error("begin_transaction", e))?;

    sqlx::query(
        "INSERT INTO subscription_cursors (subscription_id, global_position) VALUES ($1, 0) \
         ON CONFLICT (subscription_id) DO NOTHING",
    )
    .bind(id)
    .execute(&mut *tx)
    .await
    .map_err(|e| map_sqlx_error("init_cursor", e))?;

    let offset: i64 = sqlx::query_scalar(
        "SELECT global_position FROM subscription_cursors WHERE subscription_id = $1 FOR UPDATE",
    )
    .bind(id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| map_sqlx_error("load_cursor", e))?;

    let batch = fetch_batch(&mut *tx, offset.max(0) as u64, limit).await?;

    if let Some(last) = batch.last() {
        sqlx::query("UPDATE subscription_cursors SET global_position = $2 WHERE subscription_id = $1")
            .bind(id)
            .bind((last.global_pos() + 1) as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("advance_cursor", e))?;
    }

    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))?;
    Ok(batch)
}

fn insert_error(err: sqlx::Error) -> InsertFailure {
    if is_unique_violation(&err) {
        InsertFailure::Conflict
    } else {
        InsertFailure::Store(map_sqlx_error("insert_event", err))
    }
}

/// Map SQLx errors to `EventStoreError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Appends translate their own conflicts with the stream at hand.
                Some("23505") => EventStoreError::Storage(format!(
                    "unique violation on {} in {}",
                    db_err.constraint().unwrap_or("unknown constraint"),
                    operation
                )),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => EventStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    global_position: i64,
    stream_name: String,
    #[allow(dead_code)] // Decoded for completeness; ordering comes from the query.
    stream_version: i64,
    aggregate_id: String,
    event_id: Uuid,
    event_kind: String,
    event_name: String,
    event_occurred_at: String,
    event: Vec<u8>,
}

impl<'r> FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            global_position: row.try_get("global_position")?,
            stream_name: row.try_get("stream_name")?,
            stream_version: row.try_get("stream_version")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_id: row.try_get("event_id")?,
            event_kind: row.try_get("event_kind")?,
            event_name: row.try_get("event_name")?,
            event_occurred_at: row.try_get("event_occurred_at")?,
            event: row.try_get("event")?,
        })
    }
}

impl TryFrom<EventRow> for Entry {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let occurred_at = parse_timestamp(&row.event_occurred_at).map_err(|e| {
            EventStoreError::ReadStreamsFailed(format!(
                "invalid occurred_at '{}' for event {}: {e}",
                row.event_occurred_at, row.event_id
            ))
        })?;
        let kind = EventKind::parse(&row.event_kind).ok_or_else(|| {
            EventStoreError::ReadStreamsFailed(format!(
                "unknown event kind '{}' for event {}",
                row.event_kind, row.event_id
            ))
        })?;

        let event = Event::at(row.event_name, row.aggregate_id, occurred_at, row.event)
            .with_id(EventId::from_uuid(row.event_id))
            .with_kind(kind);
        Ok(Entry::new(row.global_position as u64, event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(kind: &str, occurred_at: &str) -> EventRow {
        EventRow {
            global_position: 7,
            stream_name: "customer-1".to_string(),
            stream_version: 1,
            aggregate_id: "customer-1".to_string(),
            event_id: Uuid::now_v7(),
            event_kind: kind.to_string(),
            event_name: "customer.onboarded".to_string(),
            event_occurred_at: occurred_at.to_string(),
            event: vec![1, 2, 3],
        }
    }

    #[test]
    fn insert_modes_parse_from_config_values() {
        assert_eq!(InsertMode::parse("per-row"), Some(InsertMode::PerRow));
        assert_eq!(InsertMode::parse(" Batch "), Some(InsertMode::Batch));
        assert_eq!(InsertMode::parse("bulk"), Some(InsertMode::Bulk));
        assert_eq!(InsertMode::parse("copy"), None);
        for mode in [InsertMode::PerRow, InsertMode::Batch, InsertMode::Bulk] {
            assert_eq!(InsertMode::parse(mode.as_str()), Some(mode));
        }
    }

    #[test]
    fn rows_materialize_as_entries() {
        let r = row("integration", "2024-01-07T00:00:00.123456789Z");
        let id = r.event_id;

        let entry = Entry::try_from(r).unwrap();

        assert_eq!(entry.global_pos(), 7);
        assert_eq!(entry.event().id(), EventId::from_uuid(id));
        assert_eq!(entry.event().kind(), EventKind::Integration);
        assert_eq!(entry.event().payload(), &[1, 2, 3]);
        assert_eq!(
            format_timestamp(&entry.event().occurred_at()),
            "2024-01-07T00:00:00.123456789Z"
        );
    }

    #[test]
    fn undecodable_rows_are_read_failures() {
        let err = Entry::try_from(row("domain", "yesterday")).unwrap_err();
        assert_eq!(err.code(), 9101);

        let err = Entry::try_from(row("mystery", "2024-01-07T00:00:00Z")).unwrap_err();
        assert!(matches!(err, EventStoreError::ReadStreamsFailed(_)));
    }

    fn change(stream: &str, expected: u64) -> Change {
        Change::new(stream, expected, vec![Event::new("e", stream, Vec::new())])
    }

    #[test]
    fn conflicts_name_the_stream_that_moved() {
        let changes = vec![change("a", 2), change("b", 0), change("b", 1)];
        let current = HashMap::from([("a", 2), ("b", 3)]);

        let err = conflict_for(&changes, &current);

        assert_eq!(err, EventStoreError::concurrent_change("b", 0, 3));
        assert_eq!(err.code(), 9102);
    }

    #[test]
    fn conflicts_fall_back_to_the_first_stream() {
        let changes = vec![change("a", 4), change("b", 0)];

        let unchanged = conflict_for(&changes, &HashMap::from([("a", 4)]));
        assert_eq!(unchanged, EventStoreError::concurrent_change("a", 4, 4));

        let unknown = conflict_for(&changes, &HashMap::new());
        assert_eq!(unknown, EventStoreError::concurrent_change("a", 4, 4));
    }

    #[tokio::test]
    async fn several_changes_in_per_row_mode_are_a_misconfiguration() {
        // Never connects: the mode check happens before any IO.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/never")
            .unwrap();
        let store = PostgresEventStore::new(pool);

        let err = store
            .append(vec![
                Change::new("a", 0, vec![Event::new("e", "a", Vec::new())]),
                Change::new("b", 0, vec![Event::new("e", "b", Vec::new())]),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Misconfiguration(_)));
        assert_eq!(err.code(), 9103);
    }
}

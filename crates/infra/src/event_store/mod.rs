//! Append-only event store and batch transport.
//!
//! Two backends share one contract: [`InMemoryEventStore`] for tests and
//! development, [`PostgresEventStore`] for durable storage.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod subscription;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::{InsertMode, PostgresEventStore};
pub use r#trait::{EventStore, EventStoreError, Transport};
pub use subscription::Subscription;

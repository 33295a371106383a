//! Events, commands and the event-sourced aggregate runtime.
//!
//! Everything in this crate is free of IO: value types that flow through the
//! system and the [`DomainModel`] that replays history and executes commands.

pub mod command;
pub mod envelope;
pub mod event;
pub mod model;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use command::{Batch, Command};
pub use envelope::{merge, Change, Entry, Stream};
pub use event::{Event, EventKind};
pub use model::{DomainModel, Handlers, Snapshot, Transitions};

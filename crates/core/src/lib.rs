//! `eventline-core`: foundation building blocks.
//!
//! This crate contains **pure** primitives shared by every other crate
//! (identifiers, the domain error model, time-indexed collections). It has no
//! infrastructure concerns.

pub mod error;
pub mod id;
pub mod temporal;

pub use error::{DomainError, DomainResult};
pub use id::{BatchId, CommandId, EventId};
pub use temporal::TemporalCollection;

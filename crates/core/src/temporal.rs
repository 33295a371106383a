//! Time-indexed collections.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

/// A collection of values keyed by the instant they became valid.
///
/// Lookups answer "what was known no later than `t`", i.e. the entry with the
/// greatest key `<= t`. Inserting at an existing instant replaces the value.
#[derive(Debug, Clone)]
pub struct TemporalCollection<T> {
    entries: BTreeMap<DateTime<Utc>, T>,
}

impl<T> Default for TemporalCollection<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T> TemporalCollection<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` as valid from `at` onwards.
    pub fn put(&mut self, at: DateTime<Utc>, value: T) {
        self.entries.insert(at, value);
    }

    /// The value valid at `at`, if any was recorded at or before it.
    pub fn get(&self, at: DateTime<Utc>) -> Option<&T> {
        self.entries.range(..=at).next_back().map(|(_, v)| v)
    }

    /// The most recently recorded value.
    pub fn latest(&self) -> Option<&T> {
        self.entries.values().next_back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded instants in ascending order.
    pub fn instants(&self) -> impl Iterator<Item = &DateTime<Utc>> {
        self.entries.keys()
    }
}

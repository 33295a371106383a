//! Units of append (`Change`), persisted events (`Entry`) and stream views (`Stream`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Events to append to one stream, guarded by the version the writer observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub stream: String,
    pub expected_version: u64,
    pub events: Vec<Event>,
}

impl Change {
    pub fn new(stream: impl Into<String>, expected_version: u64, events: Vec<Event>) -> Self {
        Self {
            stream: stream.into(),
            expected_version,
            events,
        }
    }

    /// Stream version after this change has been applied.
    pub fn resulting_version(&self) -> u64 {
        self.expected_version + self.events.len() as u64
    }
}

/// A persisted event tagged with its store-wide position.
///
/// Entries are only created by stores at append (or read) time. The position
/// is unique across all streams and strictly increasing in commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    global_pos: u64,
    event: Event,
}

impl Entry {
    pub fn new(global_pos: u64, event: Event) -> Self {
        Self { global_pos, event }
    }

    pub fn global_pos(&self) -> u64 {
        self.global_pos
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

/// A named, ordered event history.
///
/// `version` is the number of events in the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    name: String,
    version: u64,
    events: Vec<Event>,
}

impl Stream {
    pub fn new(name: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            name: name.into(),
            version: events.len() as u64,
            events,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

/// Collapse changes so each stream appears once.
///
/// Streams keep the order in which they first appear. Each merged change keeps
/// the lowest expected version seen for its stream and orders its events by
/// `occurred_at` (stable for equal instants).
pub fn merge(changes: impl IntoIterator<Item = Change>) -> Vec<Change> {
    let mut merged: Vec<Change> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for change in changes {
        match index.get(&change.stream) {
            Some(&i) => {
                let target = &mut merged[i];
                target.expected_version = target.expected_version.min(change.expected_version);
                target.events.extend(change.events);
            }
            None => {
                index.insert(change.stream.clone(), merged.len());
                merged.push(change);
            }
        }
    }

    for change in &mut merged {
        change.events.sort_by_key(Event::occurred_at);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn ev(name: &str, stream: &str, secs: i64) -> Event {
        Event::at(name, stream, t(secs), Vec::new())
    }

    #[test]
    fn stream_version_is_its_length() {
        let s = Stream::new("s", vec![ev("a", "s", 1), ev("b", "s", 2)]);
        assert_eq!(s.version(), 2);
        assert_eq!(Stream::new("empty", Vec::new()).version(), 0);
    }

    #[test]
    fn merge_groups_by_stream_and_keeps_lowest_expected_version() {
        let merged = merge(vec![
            Change::new("s1", 3, vec![ev("late", "s1", 30)]),
            Change::new("s2", 0, vec![ev("only", "s2", 5)]),
            Change::new("s1", 2, vec![ev("early", "s1", 10), ev("mid", "s1", 20)]),
        ]);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].stream, "s1");
        assert_eq!(merged[0].expected_version, 2);
        let names: Vec<_> = merged[0].events.iter().map(Event::name).collect();
        assert_eq!(names, vec!["early", "mid", "late"]);
        assert_eq!(merged[1].stream, "s2");
        assert_eq!(merged[0].resulting_version(), 5);
    }

    #[test]
    fn merge_keeps_insertion_order_for_equal_timestamps() {
        let merged = merge(vec![
            Change::new("s", 0, vec![ev("first", "s", 1)]),
            Change::new("s", 0, vec![ev("second", "s", 1)]),
        ]);

        let names: Vec<_> = merged[0].events.iter().map(Event::name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                .. ProptestConfig::default()
            })]

            #[test]
            fn merge_keeps_every_event_and_one_change_per_stream(
                parts in prop::collection::vec((0usize..4, 0u64..10, 0usize..4, 0i64..100), 0..20)
            ) {
                let changes: Vec<Change> = parts
                    .iter()
                    .map(|&(stream, expected, n, secs)| {
                        let name = format!("s{stream}");
                        let events = (0..n).map(|i| ev("e", &name, secs + i as i64)).collect();
                        Change::new(name, expected, events)
                    })
                    .collect();
                let total: usize = changes.iter().map(|c| c.events.len()).sum();

                let merged = merge(changes);

                prop_assert_eq!(merged.iter().map(|c| c.events.len()).sum::<usize>(), total);
                let names: std::collections::HashSet<_> = merged.iter().map(|c| c.stream.as_str()).collect();
                prop_assert_eq!(names.len(), merged.len());
                for change in &merged {
                    prop_assert!(change.events.windows(2).all(|w| w[0].occurred_at() <= w[1].occurred_at()));
                }
            }
        }
    }
}

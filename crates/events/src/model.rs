//! Event-sourced aggregate runtime.
//!
//! A concrete aggregate owns a [`DomainModel`] holding its state `S` and
//! supplies two function tables:
//!
//! - **transitions** (event name → `fn(&mut S, &Event)`) evolve state,
//! - **handlers** (command name → `fn(&mut DomainModel<S>, &Command)`) decide
//!   which events happen by calling [`DomainModel::causes`].
//!
//! A model is built by a factory for every command execution or query and
//! dropped afterwards; it is never shared between concurrent executions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use eventline_core::{DomainError, DomainResult, TemporalCollection};

use crate::command::Command;
use crate::event::Event;

/// State transition for one event name.
pub type Transition<S> = Arc<dyn Fn(&mut S, &Event) + Send + Sync>;

/// Command handler for one command name.
pub type Handler<S> = Arc<dyn Fn(&mut DomainModel<S>, &Command) -> DomainResult<()> + Send + Sync>;

/// Event name → transition table.
pub struct Transitions<S> {
    table: HashMap<String, Transition<S>>,
}

impl<S> Transitions<S> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register the transition applied for events named `event_name`.
    pub fn on<F>(mut self, event_name: impl Into<String>, transition: F) -> Self
    where
        F: Fn(&mut S, &Event) + Send + Sync + 'static,
    {
        self.table.insert(event_name.into(), Arc::new(transition));
        self
    }

    pub fn get(&self, event_name: &str) -> Option<&Transition<S>> {
        self.table.get(event_name)
    }
}

impl<S> Default for Transitions<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for Transitions<S> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

/// Command name → handler table.
pub struct Handlers<S> {
    table: HashMap<String, Handler<S>>,
}

impl<S> Handlers<S> {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    /// Register the handler executed for commands named `command_name`.
    pub fn on<F>(mut self, command_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut DomainModel<S>, &Command) -> DomainResult<()> + Send + Sync + 'static,
    {
        self.table.insert(command_name.into(), Arc::new(handler));
        self
    }

    pub fn get(&self, command_name: &str) -> Option<&Handler<S>> {
        self.table.get(command_name)
    }
}

impl<S> Default for Handlers<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for Handlers<S> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

/// State of a model right after a batch of events was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot<S> {
    pub version: u64,
    pub state: S,
}

/// The aggregate runtime: replay, command execution and point-in-time state.
pub struct DomainModel<S> {
    id: String,
    name: String,
    version: u64,
    state: S,
    transitions: Transitions<S>,
    handlers: Handlers<S>,
    changes: Vec<Event>,
    history: TemporalCollection<Snapshot<S>>,
}

impl<S: Clone> DomainModel<S> {
    /// Set up a model named `name` starting from `state`.
    pub fn init(
        name: impl Into<String>,
        state: S,
        transitions: Transitions<S>,
        handlers: Handlers<S>,
    ) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            version: 0,
            state,
            transitions,
            handlers,
            changes: Vec::new(),
            history: TemporalCollection::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Replay persisted history. Nothing is recorded as a pending change.
    pub fn load(&mut self, history: &[Event]) {
        if self.id.is_empty() {
            if let Some(first) = history.first() {
                self.id = first.aggregate_id().to_string();
            }
        }
        self.apply(history);
        debug!(model = %self.name, id = %self.id, version = self.version, "history loaded");
    }

    /// Run the handler registered for `command.name()`.
    ///
    /// Returns every pending change of this model, including those caused by
    /// earlier executions that have not been taken yet.
    pub fn execute(&mut self, command: &Command) -> DomainResult<Vec<Event>> {
        let Some(handler) = self.handlers.get(command.name()).cloned() else {
            return Err(DomainError::unknown_command(&self.name, command.name()));
        };

        if self.id.is_empty() {
            self.id = command.aggregate_id().to_string();
        }

        handler(self, command)?;
        Ok(self.changes.clone())
    }

    /// Record `events` as pending changes and apply them right away.
    pub fn causes(&mut self, events: impl IntoIterator<Item = Event>) {
        let events: Vec<Event> = events.into_iter().collect();
        self.apply(&events);
        self.changes.extend(events);
    }

    fn apply(&mut self, events: &[Event]) {
        for event in events {
            self.version += 1;
            match self.transitions.get(event.name()) {
                Some(transition) => transition(&mut self.state, event),
                None => warn!(
                    model = %self.name,
                    event = %event.name(),
                    event_id = %event.id(),
                    "no transition registered, event skipped"
                ),
            }
        }

        if let Some(last) = events.last() {
            self.history.put(
                last.occurred_at(),
                Snapshot {
                    version: self.version,
                    state: self.state.clone(),
                },
            );
        }
    }

    /// Last known state no later than `at`.
    pub fn state_at(&self, at: DateTime<Utc>) -> DomainResult<&Snapshot<S>> {
        self.history.get(at).ok_or(DomainError::NoSnapshot { at })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &S {
        &self.state
    }

    /// Events caused but not yet appended.
    pub fn changes(&self) -> &[Event] {
        &self.changes
    }

    pub fn take_changes(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.changes)
    }
}

impl<S: core::fmt::Debug> core::fmt::Debug for DomainModel<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DomainModel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("state", &self.state)
            .field("changes", &self.changes.len())
            .field("snapshots", &self.history.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    struct Account {
        opened: bool,
        balance: i64,
    }

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    fn deposited(id: &str, amount: i64, at: DateTime<Utc>) -> Event {
        Event::at("deposited", id, at, amount.to_be_bytes().to_vec())
    }

    fn amount(event: &Event) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(event.payload());
        i64::from_be_bytes(raw)
    }

    fn account() -> DomainModel<Account> {
        DomainModel::init(
            "Account",
            Account::default(),
            Transitions::new()
                .on("opened", |s: &mut Account, _| s.opened = true)
                .on("deposited", |s: &mut Account, e| s.balance += amount(e)),
            Handlers::new()
                .on("open", |m: &mut DomainModel<Account>, c| {
                    if m.state().opened {
                        return Err(DomainError::rejected("already open"));
                    }
                    m.causes([Event::new("opened", c.aggregate_id(), Vec::new())]);
                    Ok(())
                })
                .on("open-and-fund", |m: &mut DomainModel<Account>, c| {
                    m.causes([Event::new("opened", c.aggregate_id(), Vec::new())]);
                    // The transition above already ran.
                    if !m.state().opened {
                        return Err(DomainError::invariant("open not observed"));
                    }
                    m.causes([deposited(c.aggregate_id(), 100, Utc::now())]);
                    Ok(())
                }),
        )
    }

    #[test]
    fn load_replays_history_without_pending_changes() {
        let mut model = account();
        model.load(&[
            Event::at("opened", "acc-1", t(0), Vec::new()),
            deposited("acc-1", 10, t(1)),
            deposited("acc-1", 5, t(2)),
        ]);

        assert_eq!(model.version(), 3);
        assert_eq!(model.id(), "acc-1");
        assert_eq!(model.state().balance, 15);
        assert!(model.changes().is_empty());
    }

    #[test]
    fn unknown_events_are_skipped_but_counted() {
        let mut model = account();
        model.load(&[
            Event::at("opened", "acc-1", t(0), Vec::new()),
            Event::at("renamed-in-a-later-release", "acc-1", t(1), Vec::new()),
        ]);

        assert_eq!(model.version(), 2);
        assert!(model.state().opened);
    }

    #[test]
    fn caused_events_are_visible_later_in_the_same_handler() {
        let mut model = account();
        let changes = model.execute(&Command::new("open-and-fund", "acc-1")).unwrap();

        let names: Vec<_> = changes.iter().map(Event::name).collect();
        assert_eq!(names, vec!["opened", "deposited"]);
        assert_eq!(model.state().balance, 100);
        assert_eq!(model.version(), 2);
    }

    #[test]
    fn execute_returns_all_pending_changes() {
        let mut model = account();
        model.execute(&Command::new("open", "acc-1")).unwrap();
        let err = model.execute(&Command::new("open", "acc-1")).unwrap_err();
        assert_eq!(err, DomainError::rejected("already open"));

        let changes = model.take_changes();
        assert_eq!(changes.len(), 1);
        assert!(model.changes().is_empty());
    }

    #[test]
    fn unknown_command_fails_without_mutation() {
        let mut model = account();
        let err = model.execute(&Command::new("close", "acc-1")).unwrap_err();

        assert_eq!(err, DomainError::unknown_command("Account", "close"));
        assert_eq!(model.version(), 0);
        assert_eq!(model.id(), "");
        assert!(model.changes().is_empty());
    }

    #[test]
    fn state_at_returns_last_known_state_no_later_than_instant() {
        let mut model = account();
        model.load(&[Event::at("opened", "acc-1", t(0), Vec::new())]);
        model.load(&[deposited("acc-1", 10, t(10)), deposited("acc-1", 20, t(20))]);
        model.load(&[deposited("acc-1", 30, t(30))]);

        let err = model.state_at(t(0) - Duration::seconds(1)).unwrap_err();
        assert!(matches!(err, DomainError::NoSnapshot { .. }));

        let s = model.state_at(t(5)).unwrap();
        assert_eq!((s.version, s.state.balance), (1, 0));

        // One snapshot per applied batch, keyed by its last event.
        let s = model.state_at(t(15)).unwrap();
        assert_eq!((s.version, s.state.balance), (1, 0));
        let s = model.state_at(t(20)).unwrap();
        assert_eq!((s.version, s.state.balance), (3, 30));

        let s = model.state_at(t(100)).unwrap();
        assert_eq!((s.version, s.state.balance), (4, 60));
    }
}

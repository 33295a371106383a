//! Given/When/Then helpers for aggregate tests.
//!
//! ```ignore
//! let mut bc = BoundedContext::new(customer_model());
//! bc.given(&[onboarded("c-1")]);
//! bc.when(&Command::new("activate", "c-1").with_expected_version(1)).unwrap();
//! bc.then(&[Event::new("customer.activated", "c-1", Vec::new())]);
//! ```

use eventline_core::DomainResult;

use crate::command::Command;
use crate::event::Event;
use crate::model::DomainModel;

/// Drives one [`DomainModel`] through a test scenario.
pub struct BoundedContext<S> {
    model: DomainModel<S>,
}

impl<S: Clone> BoundedContext<S> {
    pub fn new(model: DomainModel<S>) -> Self {
        Self { model }
    }

    /// Replay `history` as already persisted events.
    pub fn given(&mut self, history: &[Event]) -> &mut Self {
        self.model.load(history);
        self
    }

    /// Execute `command` and return the pending changes.
    pub fn when(&mut self, command: &Command) -> DomainResult<Vec<Event>> {
        self.model.execute(command)
    }

    /// Assert the pending changes match `expected` by name, aggregate id and payload.
    ///
    /// Ids and timestamps are generated and therefore ignored.
    #[track_caller]
    pub fn then(&self, expected: &[Event]) {
        let actual: Vec<_> = self.model.changes().iter().map(comparable).collect();
        let expected: Vec<_> = expected.iter().map(comparable).collect();
        assert_eq!(actual, expected, "unexpected changes");
    }

    pub fn model(&self) -> &DomainModel<S> {
        &self.model
    }
}

fn comparable(event: &Event) -> (&str, &str, &[u8]) {
    (event.name(), event.aggregate_id(), event.payload())
}

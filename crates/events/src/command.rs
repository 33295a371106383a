use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use eventline_core::{BatchId, CommandId};

/// A request to change one aggregate.
///
/// Commands are immutable values. The completion signal a submitter waits on
/// is not part of the command; the command queue pairs each command with its
/// own one-shot reply channel when it is submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    id: CommandId,
    name: String,
    aggregate_id: String,
    expected_version: u64,
    issued_at: DateTime<Utc>,
    payload: Vec<u8>,
}

impl Command {
    /// A command for a stream the caller expects to be empty (version 0).
    pub fn new(name: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            id: CommandId::new(),
            name: name.into(),
            aggregate_id: aggregate_id.into(),
            expected_version: 0,
            issued_at: Utc::now(),
            payload: Vec::new(),
        }
    }

    /// The version the aggregate's stream must have when the resulting events are appended.
    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = version;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_json_payload<T: Serialize>(self, payload: &T) -> serde_json::Result<Self> {
        Ok(self.with_payload(serde_json::to_vec(payload)?))
    }

    pub fn with_id(mut self, id: CommandId) -> Self {
        self.id = id;
        self
    }

    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn expected_version(&self) -> u64 {
        self.expected_version
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// An ordered group of commands that is committed as one append.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    id: BatchId,
    commands: Vec<Command>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn add_commands(&mut self, commands: impl IntoIterator<Item = Command>) -> &mut Self {
        self.commands.extend(commands);
        self
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl FromIterator<Command> for Batch {
    fn from_iter<I: IntoIterator<Item = Command>>(iter: I) -> Self {
        let mut batch = Batch::new();
        batch.add_commands(iter);
        batch
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use eventline_core::EventId;

/// Whether an event is internal to a bounded context or meant for others.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Domain,
    Integration,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Domain => "domain",
            EventKind::Integration => "integration",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "domain" => Some(EventKind::Domain),
            "integration" => Some(EventKind::Integration),
            _ => None,
        }
    }
}

/// An immutable fact.
///
/// Events are created by command handlers (through `DomainModel::causes`) or
/// materialized by a store from persisted rows. The payload is opaque to the
/// runtime; identity is the `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    id: EventId,
    name: String,
    aggregate_id: String,
    payload: Vec<u8>,
    #[serde(with = "rfc3339_nanos")]
    occurred_at: DateTime<Utc>,
}

impl Event {
    /// A domain event that occurred now.
    pub fn new(name: impl Into<String>, aggregate_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::at(name, aggregate_id, Utc::now(), payload)
    }

    /// An integration event that occurred now.
    pub fn integration(
        name: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self::new(name, aggregate_id, payload).with_kind(EventKind::Integration)
    }

    /// A domain event that occurred at an explicit instant.
    pub fn at(
        name: impl Into<String>,
        aggregate_id: impl Into<String>,
        occurred_at: DateTime<Utc>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind: EventKind::Domain,
            id: EventId::new(),
            name: name.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            occurred_at,
        }
    }

    /// A domain event whose payload is the JSON encoding of `payload`.
    pub fn json<T: Serialize>(
        name: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(name, aggregate_id, serde_json::to_vec(payload)?))
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = id;
        self
    }

    pub fn with_kind(mut self, kind: EventKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Render a timestamp in the fixed-width form used on the wire and in storage.
///
/// Always nine fractional digits and a `Z` suffix, so the textual order equals
/// the chronological order.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a timestamp produced by [`format_timestamp`] (any RFC 3339 offset is accepted).
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|at| at.with_timezone(&Utc))
}

mod rfc3339_nanos {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

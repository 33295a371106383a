//! Runtime configuration from `EVENTLINE_*` environment variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `EVENTLINE_DATABASE_URL` | unset (volatile store) |
//! | `EVENTLINE_INSERT_MODE` | `per-row` |
//! | `EVENTLINE_QUEUE_WORKERS` | 4 |
//! | `EVENTLINE_QUEUE_CAPACITY` | 1024 |
//! | `EVENTLINE_QUEUE_TIMEOUT_MS` | 400 |
//! | `EVENTLINE_SUBSCRIPTION_SLA_MS` | 5000 |
//! | `EVENTLINE_BATCH_SIZE` | 4096 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::command_queue::CommandQueueConfig;
use crate::event_store::InsertMode;
use crate::subscription::CatchUpConfig;

pub const DATABASE_URL: &str = "EVENTLINE_DATABASE_URL";
pub const INSERT_MODE: &str = "EVENTLINE_INSERT_MODE";
pub const QUEUE_WORKERS: &str = "EVENTLINE_QUEUE_WORKERS";
pub const QUEUE_CAPACITY: &str = "EVENTLINE_QUEUE_CAPACITY";
pub const QUEUE_TIMEOUT_MS: &str = "EVENTLINE_QUEUE_TIMEOUT_MS";
pub const SUBSCRIPTION_SLA_MS: &str = "EVENTLINE_SUBSCRIPTION_SLA_MS";
pub const BATCH_SIZE: &str = "EVENTLINE_BATCH_SIZE";

const MASK: &str = "******";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Clone, PartialEq, Eq, Default)]
pub struct Config {
    /// Postgres connection string; `None` selects the volatile store.
    pub database_url: Option<String>,
    pub insert_mode: InsertMode,
    pub queue: CommandQueueConfig,
    pub catch_up: CatchUpConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();

        let database_url = secret(&lookup, DATABASE_URL);

        let insert_mode = match value(&lookup, INSERT_MODE) {
            Some(raw) => InsertMode::parse(&raw).ok_or_else(|| ConfigError::Invalid {
                key: INSERT_MODE,
                value: raw.clone(),
                reason: "expected per-row, batch or bulk".to_string(),
            })?,
            None => defaults.insert_mode,
        };

        let queue = CommandQueueConfig {
            workers: positive(&lookup, QUEUE_WORKERS)?.unwrap_or(defaults.queue.workers),
            capacity: positive(&lookup, QUEUE_CAPACITY)?.unwrap_or(defaults.queue.capacity),
            timeout: positive::<u64>(&lookup, QUEUE_TIMEOUT_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.queue.timeout),
        };

        let catch_up = CatchUpConfig {
            sla: positive::<u64>(&lookup, SUBSCRIPTION_SLA_MS)?
                .map(Duration::from_millis)
                .unwrap_or(defaults.catch_up.sla),
            batch_size: parsed(&lookup, BATCH_SIZE)?.unwrap_or(defaults.catch_up.batch_size),
        };

        Ok(Self {
            database_url,
            insert_mode,
            queue,
            catch_up,
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url.as_ref().map(|_| MASK))
            .field("insert_mode", &self.insert_mode)
            .field("queue", &self.queue)
            .field("catch_up", &self.catch_up)
            .finish()
    }
}

fn value(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<String> {
    match lookup(key) {
        Some(v) => {
            debug!(key, value = %v, "config value");
            Some(v)
        }
        None => {
            debug!(key, "config value unset, using default");
            None
        }
    }
}

fn secret(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Option<String> {
    let v = lookup(key);
    let shown = if v.is_some() { MASK } else { "<unset>" };
    debug!(key, value = shown, "config secret");
    v
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value(lookup, key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr + Default + PartialEq + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match parsed::<T>(lookup, key)? {
        Some(v) if v == T::default() => Err(ConfigError::Invalid {
            key,
            value: v.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other),
    }
}

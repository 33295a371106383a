//! Infrastructure layer: event stores, subscriptions, command execution.

pub mod checkpoint;
pub mod command_queue;
pub mod command_service;
pub mod config;
pub mod consume;
pub mod event_store;
pub mod subscription;


pub use command_queue::{CommandError, CommandHandler, CommandQueue, CommandQueueConfig};
pub use command_service::CommandService;
pub use config::{Config, ConfigError};

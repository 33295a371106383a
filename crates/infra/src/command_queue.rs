//! Bounded command queue served by a fixed pool of workers.
//!
//! ```text
//! send(cmd) ──► [ bounded queue ] ──► worker 1 ──► handler
//!                                 ├─► worker 2 ──► handler
//!                                 └─► worker N ──► handler
//! ```
//!
//! The first idle worker takes the next job. Each job carries a one-shot
//! reply channel; the submitter waits for it until the deadline. A deadline
//! that passes does not cancel the handler, which runs to completion and has
//! its result discarded.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

use eventline_core::DomainError;
use eventline_events::Command;

use crate::event_store::EventStoreError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(400);
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_CAPACITY: usize = 1024;

/// Command-level error: everything a submitter can get back from `send`.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("timeout! executing command '{command}' took longer than {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("command queue closed")]
    QueueClosed,

    #[error("command handler panicked: {0}")]
    HandlerPanicked(String),
}

impl CommandError {
    /// Stable numeric code of this error.
    pub fn code(&self) -> u32 {
        match self {
            CommandError::Timeout { .. } => 9001,
            CommandError::Domain(e) => e.code(),
            CommandError::Store(e) => e.code(),
            CommandError::QueueClosed => 9004,
            CommandError::HandlerPanicked(_) => 9005,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            CommandError::Timeout { .. } => true,
            CommandError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Errors that point at wiring mistakes rather than runtime conditions.
    pub fn is_programmer_error(&self) -> bool {
        match self {
            CommandError::Domain(e) => e.is_programmer_error(),
            CommandError::Store(EventStoreError::Misconfiguration(_)) => true,
            _ => false,
        }
    }
}

/// Executes commands taken from the queue.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, command: Command) -> Result<(), CommandError>;
}

#[async_trait]
impl<H> CommandHandler for Arc<H>
where
    H: CommandHandler + ?Sized,
{
    async fn handle(&self, command: Command) -> Result<(), CommandError> {
        (**self).handle(command).await
    }
}

/// Adapter turning an async closure into a [`CommandHandler`].
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Command) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), CommandError>> + Send + 'static,
{
    async fn handle(&self, command: Command) -> Result<(), CommandError> {
        (self.0)(command).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandQueueConfig {
    pub workers: usize,
    pub capacity: usize,
    /// How long `send` waits, queueing time included.
    pub timeout: Duration,
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_CAPACITY,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl CommandQueueConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct Job {
    command: Command,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

/// Handle to a running worker pool.
pub struct CommandQueue {
    sender: mpsc::Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    config: CommandQueueConfig,
}

impl CommandQueue {
    /// Start `config.workers` workers serving `handler`. Requires a tokio runtime.
    pub fn start<H: CommandHandler>(config: CommandQueueConfig, handler: H) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let handler: Arc<dyn CommandHandler> = Arc::new(handler);

        let workers = (0..config.workers.max(1))
            .map(|index| tokio::spawn(work(index, receiver.clone(), handler.clone())))
            .collect::<Vec<_>>();

        info!(
            workers = workers.len(),
            capacity = config.capacity,
            timeout_ms = config.timeout.as_millis() as u64,
            "command queue started"
        );

        Self {
            sender,
            workers,
            config,
        }
    }

    pub fn config(&self) -> &CommandQueueConfig {
        &self.config
    }

    /// Submit `command` and wait for its outcome or the configured timeout.
    pub async fn send(&self, command: Command) -> Result<(), CommandError> {
        self.send_with_timeout(command, self.config.timeout).await
    }

    pub async fn send_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<(), CommandError> {
        let name = command.name().to_string();
        let id = command.id();
        let (reply, outcome) = oneshot::channel();

        let submitted = async {
            self.sender
                .send(Job { command, reply })
                .await
                .map_err(|_| CommandError::QueueClosed)?;
            outcome.await.map_err(|_| CommandError::QueueClosed)?
        };

        match tokio::time::timeout(timeout, submitted).await {
            Ok(result) => result,
            Err(_) => {
                warn!(command = %name, command_id = %id, timeout_ms = timeout.as_millis() as u64, "command timed out");
                Err(CommandError::Timeout {
                    command: name,
                    timeout,
                })
            }
        }
    }

    /// Close the queue and wait for the workers to finish queued jobs.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("command queue stopped");
    }
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandQueue")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .finish()
    }
}

async fn work(
    index: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    handler: Arc<dyn CommandHandler>,
) {
    loop {
        let job = receiver.lock().await.recv().await;
        let Some(Job { command, reply }) = job else {
            break;
        };

        let name = command.name().to_string();
        let id = command.id();
        let handler = handler.clone();

        // A panicking handler takes down its own task, not the worker.
        let outcome = match tokio::spawn(async move { handler.handle(command).await }).await {
            Ok(result) => result,
            Err(err) => Err(CommandError::HandlerPanicked(panic_message(err))),
        };

        match &outcome {
            Ok(()) => debug!(worker = index, command = %name, command_id = %id, "command executed"),
            Err(err) => {
                warn!(worker = index, command = %name, command_id = %id, error = %err, "command execution failed")
            }
        }
        // The submitter may have timed out already.
        let _ = reply.send(outcome);
    }
    debug!(worker = index, "worker stopped");
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "handler task cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use eventline_events::Entry;

use super::tracing_filter::span_label;
use super::{AckFn, ConsumeError, Consumer, Context, NackFn};

/// Default number of batches a filter buffers before `handle` waits.
pub const DEFAULT_BUFFER: usize = 1024;

struct Job {
    ctx: Context,
    entries: Vec<Entry>,
}

/// Hands batches to a background task that feeds `next` one entry at a time.
///
/// `handle` only enqueues. The task acks every entry `next` accepts. On the
/// first failure it nacks the failed entry, the rest of its batch and every
/// batch still queued, then exits: every entry is acked or nacked exactly
/// once. After that, `handle` returns [`ConsumeError::Stopped`].
///
/// Must be created inside a tokio runtime.
pub struct ConcurrentFilter {
    sender: mpsc::Sender<Job>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConcurrentFilter {
    pub fn spawn<C>(next: C, ack: Option<AckFn>, nack: Option<NackFn>) -> Self
    where
        C: Consumer + 'static,
    {
        Self::spawn_with_buffer(next, ack, nack, DEFAULT_BUFFER)
    }

    pub fn spawn_with_buffer<C>(
        next: C,
        ack: Option<AckFn>,
        nack: Option<NackFn>,
        buffer: usize,
    ) -> Self
    where
        C: Consumer + 'static,
    {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(dispatch(next, receiver, stop_rx, ack, nack));

        Self {
            sender,
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    /// `true` once the dispatch task no longer accepts batches.
    pub fn is_stopped(&self) -> bool {
        self.sender.is_closed()
    }

    /// Ask the dispatch task to stop after the batch in progress.
    ///
    /// Batches still queued are nacked.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Wait for the dispatch task to exit.
    pub async fn stopped(&self) {
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for ConcurrentFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentFilter")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[async_trait]
impl Consumer for ConcurrentFilter {
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        self.sender
            .send(Job {
                ctx: ctx.clone(),
                entries: entries.to_vec(),
            })
            .await
            .map_err(|_| ConsumeError::Stopped)
    }
}

async fn dispatch<C: Consumer>(
    next: C,
    mut receiver: mpsc::Receiver<Job>,
    mut stop: watch::Receiver<bool>,
    ack: Option<AckFn>,
    nack: Option<NackFn>,
) {
    'jobs: loop {
        let job = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break 'jobs,
            job = receiver.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };

        for (i, entry) in job.entries.iter().enumerate() {
            let one = std::slice::from_ref(entry);
            match next.handle(&job.ctx.with_entries(one), one).await {
                Ok(()) => {
                    if let Some(ack) = &ack {
                        ack(one);
                    }
                }
                Err(err) => {
                    warn!(
                        subscription = job.ctx.subscription_id(),
                        entry = %span_label(entry),
                        error = %err,
                        "couldn't handle entry, concurrent filter stops"
                    );
                    if let Some(nack) = &nack {
                        nack(&job.entries[i..]);
                    }
                    break 'jobs;
                }
            }
        }
    }

    receiver.close();
    let mut dropped = 0usize;
    while let Ok(job) = receiver.try_recv() {
        dropped += job.entries.len();
        if let Some(nack) = &nack {
            nack(&job.entries);
        }
    }
    debug!(dropped, "concurrent filter stopped");
}

//! Catch-up subscription: polls the transport and feeds a consumer.
//!
//! Every tick the subscription fetches the entries at or after its checkpoint.
//! A batch the consumer accepts is acked: the checkpoint moves past it, is
//! persisted when a checkpoint store is configured, and the ack hook runs. A
//! rejected batch is nacked and fetched again on a later tick.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eventline_events::Entry;

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::consume::{AckFn, CancelScope, Consumer, Context, NackFn};
use crate::event_store::{EventStoreError, Transport};

/// How stale a read model may become before the subscription catches up.
pub mod sla {
    use std::time::Duration;

    pub const MICRO: Duration = Duration::from_millis(10);
    pub const SHORT: Duration = Duration::from_secs(5);
    pub const MEDIUM: Duration = Duration::from_secs(60);
    pub const LARGE: Duration = Duration::from_secs(10 * 60);
    pub const LONG: Duration = Duration::from_secs(60 * 60);
}

/// Upper bounds for one fetch.
pub mod batch_size {
    pub const XS: usize = 1024;
    pub const S: usize = 2048;
    pub const M: usize = 4096;
    pub const L: usize = 8192;
    pub const XL: usize = 16384;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchUpConfig {
    /// Poll interval.
    pub sla: Duration,
    /// Max entries per fetch (0 = unlimited).
    pub batch_size: usize,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            sla: sla::SHORT,
            batch_size: batch_size::M,
        }
    }
}

impl CatchUpConfig {
    pub fn with_sla(mut self, sla: Duration) -> Self {
        self.sla = sla;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Idle,
    Listening,
    Stopped,
}

const IDLE: u8 = 0;
const LISTENING: u8 = 1;
const STOPPED: u8 = 2;

/// Polling subscription over a [`Transport`].
///
/// Dropping the subscription stops its polling task.
pub struct CatchUpSubscription {
    id: String,
    worker_id: String,
    config: CatchUpConfig,
    transport: Arc<dyn Transport>,
    consumer: Arc<dyn Consumer>,
    checkpoint: Arc<Checkpoint>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    ack: Option<AckFn>,
    nack: Option<NackFn>,
    state: Arc<AtomicU8>,
    shutdown: watch::Sender<bool>,
}

impl CatchUpSubscription {
    /// A subscription that starts reading at `offset`.
    pub fn new(
        id: impl Into<String>,
        offset: u64,
        transport: Arc<dyn Transport>,
        consumer: Arc<dyn Consumer>,
    ) -> Self {
        let id = id.into();
        let checkpoint = Arc::new(Checkpoint::with_position(id.clone(), offset));
        Self::from_checkpoint(checkpoint, transport, consumer)
    }

    /// A subscription that continues from the checkpoint stored for `id`.
    pub async fn resume(
        id: impl Into<String>,
        transport: Arc<dyn Transport>,
        consumer: Arc<dyn Consumer>,
        store: Arc<dyn CheckpointStore>,
    ) -> Result<Self, EventStoreError> {
        let id = id.into();
        let checkpoint = store.get_latest_checkpoint(&id).await?;
        info!(subscription = %id, position = checkpoint.position(), "resuming from checkpoint");
        Ok(Self::from_checkpoint(Arc::new(checkpoint), transport, consumer)
            .with_checkpoint_store(store))
    }

    fn from_checkpoint(
        checkpoint: Arc<Checkpoint>,
        transport: Arc<dyn Transport>,
        consumer: Arc<dyn Consumer>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            id: checkpoint.id().to_string(),
            worker_id: Uuid::now_v7().to_string(),
            config: CatchUpConfig::default(),
            transport,
            consumer,
            checkpoint,
            checkpoint_store: None,
            ack: None,
            nack: None,
            state: Arc::new(AtomicU8::new(IDLE)),
            shutdown,
        }
    }

    pub fn with_config(mut self, config: CatchUpConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Runs after a batch was acked and the checkpoint moved.
    pub fn with_ack(mut self, ack: AckFn) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Runs after the consumer rejected a batch.
    pub fn with_nack(mut self, nack: NackFn) -> Self {
        self.nack = Some(nack);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn checkpoint(&self) -> Arc<Checkpoint> {
        self.checkpoint.clone()
    }

    pub fn state(&self) -> SubscriptionState {
        match self.state.load(Ordering::Acquire) {
            IDLE => SubscriptionState::Idle,
            LISTENING => SubscriptionState::Listening,
            _ => SubscriptionState::Stopped,
        }
    }

    /// Start the polling task.
    ///
    /// Only the first call on an idle subscription starts anything; later
    /// calls log a warning and return `None`. Requires a tokio runtime.
    pub fn listen(&self) -> Option<JoinHandle<()>> {
        if self
            .state
            .compare_exchange(IDLE, LISTENING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(
                subscription = %self.id,
                worker = %self.worker_id,
                state = ?self.state(),
                "subscription already listening or stopped, ignored"
            );
            return None;
        }

        let poller = Poller {
            id: self.id.clone(),
            worker_id: self.worker_id.clone(),
            config: self.config,
            transport: self.transport.clone(),
            consumer: self.consumer.clone(),
            checkpoint: self.checkpoint.clone(),
            checkpoint_store: self.checkpoint_store.clone(),
            ack: self.ack.clone(),
            nack: self.nack.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
        };
        Some(tokio::spawn(poller.run()))
    }

    /// Request the polling task to stop after the batch in progress.
    pub fn stop(&self) {
        self.state.store(STOPPED, Ordering::Release);
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for CatchUpSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CatchUpSubscription")
            .field("id", &self.id)
            .field("worker_id", &self.worker_id)
            .field("config", &self.config)
            .field("position", &self.checkpoint.position())
            .field("state", &self.state())
            .finish()
    }
}

struct Poller {
    id: String,
    worker_id: String,
    config: CatchUpConfig,
    transport: Arc<dyn Transport>,
    consumer: Arc<dyn Consumer>,
    checkpoint: Arc<Checkpoint>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    ack: Option<AckFn>,
    nack: Option<NackFn>,
    state: Arc<AtomicU8>,
    shutdown: watch::Receiver<bool>,
}

impl Poller {
    async fn run(mut self) {
        info!(
            subscription = %self.id,
            worker = %self.worker_id,
            position = self.checkpoint.position(),
            sla_ms = self.config.sla.as_millis() as u64,
            "start listening"
        );

        let mut ticker = tokio::time::interval(self.config.sla);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }
            self.poll_once().await;
        }

        self.state.store(STOPPED, Ordering::Release);
        info!(subscription = %self.id, worker = %self.worker_id, "subscription stopped");
    }

    async fn poll_once(&self) {
        let offset = self.checkpoint.position();
        let entries = match self
            .transport
            .subscribe_with_offset(offset, self.config.batch_size)
            .recv()
            .await
        {
            Ok(entries) => entries,
            Err(err) => {
                warn!(subscription = %self.id, offset, error = %err, "fetch failed, retrying next tick");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }
        debug!(subscription = %self.id, offset, count = entries.len(), "inflight new entries");

        let ctx = Context::new(
            self.id.clone(),
            CancelScope::new(self.shutdown.clone()),
            &entries,
        );
        match self.consumer.handle(&ctx, &entries).await {
            Ok(()) => self.acknowledge(&entries).await,
            Err(err) => {
                warn!(
                    subscription = %self.id,
                    offset,
                    count = entries.len(),
                    error = %err,
                    "consume entries failed"
                );
                if let Some(nack) = &self.nack {
                    nack(&entries);
                }
            }
        }
    }

    async fn acknowledge(&self, entries: &[Entry]) {
        let next = self.checkpoint.next_position(entries);
        let position = self.checkpoint.update(next);
        debug!(subscription = %self.id, position, "checkpoint advanced");

        if let Some(store) = &self.checkpoint_store {
            if let Err(err) = store.store_checkpoint(&self.checkpoint).await {
                warn!(subscription = %self.id, position, error = %err, "storing checkpoint failed");
            }
        }
        if let Some(ack) = &self.ack {
            ack(entries);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use eventline_events::{Change, Event};

    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::consume::{ConsumeError, DefaultConsumer};
    use crate::event_store::{EventStore, InMemoryEventStore, Subscription};

    type Positions = Arc<Mutex<Vec<u64>>>;

    fn collect(into: &Positions) -> AckFn {
        let into = into.clone();
        Arc::new(move |entries: &[Entry]| {
            into.lock().unwrap().extend(entries.iter().map(Entry::global_pos));
        })
    }

    fn accept_all() -> Arc<dyn Consumer> {
        Arc::new(DefaultConsumer::new().with_handler("noop", |_: &Event| Ok(())).unwrap())
    }

    fn fast() -> CatchUpConfig {
        CatchUpConfig::default().with_sla(sla::MICRO)
    }

    async fn append(store: &InMemoryEventStore, stream: &str, version: u64, name: &str) {
        store
            .append(vec![Change::new(
                stream,
                version,
                vec![Event::new(name, stream, Vec::new())],
            )])
            .await
            .unwrap();
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
    }

    #[tokio::test]
    async fn catches_up_with_events_appended_while_listening() {
        let store = Arc::new(InMemoryEventStore::new());
        for version in 0..123 {
            append(&store, "test-stream-0", version, "test-event").await;
        }

        let delivered = Positions::default();
        let sub = CatchUpSubscription::new("test-subscription", 123, store.clone(), accept_all())
            .with_config(fast())
            .with_ack(collect(&delivered));
        let task = sub.listen().unwrap();

        append(&store, "test-stream-1", 0, "test-event-1").await;
        append(&store, "test-stream-2", 0, "test-event-2").await;
        append(&store, "test-stream-1", 1, "test-event-3").await;
        append(&store, "test-stream-2", 1, "test-event-4").await;
        append(&store, "test-stream-3", 0, "test-event-5").await;
        append(&store, "test-stream-2", 2, "test-event-6").await;

        let checkpoint = sub.checkpoint();
        wait_until("checkpoint 129", || checkpoint.position() == 129).await;
        assert_eq!(*delivered.lock().unwrap(), (123..=128).collect::<Vec<_>>());

        sub.stop();
        task.await.unwrap();
        assert_eq!(sub.state(), SubscriptionState::Stopped);
    }

    #[tokio::test]
    async fn listen_starts_only_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let sub = CatchUpSubscription::new("once", 0, store, accept_all()).with_config(fast());

        let task = sub.listen().unwrap();
        assert_eq!(sub.state(), SubscriptionState::Listening);
        assert!(sub.listen().is_none());

        sub.stop();
        task.await.unwrap();
        assert!(sub.listen().is_none());
    }

    struct FailFirst {
        failed: Mutex<bool>,
    }

    #[async_trait]
    impl Consumer for FailFirst {
        async fn handle(&self, _ctx: &Context, _entries: &[Entry]) -> Result<(), ConsumeError> {
            let mut failed = self.failed.lock().unwrap();
            if *failed {
                return Ok(());
            }
            *failed = true;
            Err(ConsumeError::Other("not yet".to_string()))
        }
    }

    #[tokio::test]
    async fn nacked_batches_are_redelivered() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "s", 0, "e").await;
        append(&store, "s", 1, "e").await;

        let (acked, nacked) = (Positions::default(), Positions::default());
        let consumer = Arc::new(FailFirst {
            failed: Mutex::new(false),
        });
        let sub = CatchUpSubscription::new("retry", 0, store, consumer)
            .with_config(fast())
            .with_ack(collect(&acked))
            .with_nack(collect(&nacked));
        let task = sub.listen().unwrap();

        let checkpoint = sub.checkpoint();
        wait_until("checkpoint 2", || checkpoint.position() == 2).await;
        assert_eq!(*nacked.lock().unwrap(), vec![0, 1]);
        assert_eq!(*acked.lock().unwrap(), vec![0, 1]);

        sub.stop();
        task.await.unwrap();
    }

    /// Fails the first `failures` fetches, then reads from `inner`.
    struct FlakyTransport {
        inner: Arc<InMemoryEventStore>,
        failures: Mutex<u32>,
        offsets: Positions,
    }

    impl Transport for FlakyTransport {
        fn subscribe_with_offset(&self, offset: u64, limit: usize) -> Subscription {
            self.offsets.lock().unwrap().push(offset);
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Subscription::ready(Err(EventStoreError::ReadStreamsFailed(
                    "connection reset".to_string(),
                )));
            }
            self.inner.subscribe_with_offset(offset, limit)
        }

        fn subscribe_with_id(&self, id: &str, limit: usize) -> Subscription {
            self.inner.subscribe_with_id(id, limit)
        }
    }

    #[tokio::test]
    async fn failed_fetches_keep_the_checkpoint_and_retry() {
        let store = Arc::new(InMemoryEventStore::new());
        append(&store, "s", 0, "e").await;
        append(&store, "s", 1, "e").await;

        let offsets = Positions::default();
        let transport = Arc::new(FlakyTransport {
            inner: store,
            failures: Mutex::new(2),
            offsets: offsets.clone(),
        });
        let checkpoints = Arc::new(InMemoryCheckpointStore::new());
        let (acked, nacked) = (Positions::default(), Positions::default());
        let sub = CatchUpSubscription::new("flaky", 0, transport, accept_all())
            .with_config(fast())
            .with_checkpoint_store(checkpoints.clone())
            .with_ack(collect(&acked))
            .with_nack(collect(&nacked));
        let task = sub.listen().unwrap();

        let checkpoint = sub.checkpoint();
        wait_until("checkpoint 2", || checkpoint.position() == 2).await;
        sub.stop();
        task.await.unwrap();

        let offsets = offsets.lock().unwrap().clone();
        assert_eq!(&offsets[..3], &[0, 0, 0]);
        assert_eq!(*acked.lock().unwrap(), vec![0, 1]);
        assert!(nacked.lock().unwrap().is_empty());
        let stored = checkpoints.get_latest_checkpoint("flaky").await.unwrap();
        assert_eq!(stored.position(), 2);
    }

    #[tokio::test]
    async fn resume_continues_from_the_stored_checkpoint() {
        let store = Arc::new(InMemoryEventStore::new());
        for version in 0..3 {
            append(&store, "s", version, "e").await;
        }
        let checkpoints: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

        let first =
            CatchUpSubscription::resume("projection", store.clone(), accept_all(), checkpoints.clone())
                .await
                .unwrap()
                .with_config(fast());
        let task = first.listen().unwrap();
        let checkpoint = first.checkpoint();
        wait_until("checkpoint 3", || checkpoint.position() == 3).await;
        first.stop();
        task.await.unwrap();

        append(&store, "s", 3, "e").await;

        let delivered = Positions::default();
        let second =
            CatchUpSubscription::resume("projection", store, accept_all(), checkpoints.clone())
                .await
                .unwrap()
                .with_config(fast())
                .with_ack(collect(&delivered));
        assert_eq!(second.checkpoint().position(), 3);

        let task = second.listen().unwrap();
        let checkpoint = second.checkpoint();
        wait_until("checkpoint 4", || checkpoint.position() == 4).await;
        assert_eq!(*delivered.lock().unwrap(), vec![3]);
        second.stop();
        task.await.unwrap();

        let stored = checkpoints.get_latest_checkpoint("projection").await.unwrap();
        assert_eq!(stored.position(), 4);
    }
}

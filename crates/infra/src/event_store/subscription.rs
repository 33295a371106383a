use tokio::sync::oneshot;

use eventline_events::Entry;

use super::r#trait::EventStoreError;

/// Handle to one batch fetch.
///
/// A subscription yields exactly one result and is consumed by reading it.
/// Backends either fill it immediately or from a background task.
#[derive(Debug)]
pub struct Subscription {
    receiver: oneshot::Receiver<Result<Vec<Entry>, EventStoreError>>,
}

impl Subscription {
    pub fn new(receiver: oneshot::Receiver<Result<Vec<Entry>, EventStoreError>>) -> Self {
        Self { receiver }
    }

    /// A subscription whose batch is already known.
    pub fn ready(result: Result<Vec<Entry>, EventStoreError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx)
    }

    /// Wait for the batch.
    pub async fn recv(self) -> Result<Vec<Entry>, EventStoreError> {
        self.receiver.await.unwrap_or_else(|_| {
            Err(EventStoreError::Storage(
                "subscription closed before delivering a batch".to_string(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_events::Event;

    #[tokio::test]
    async fn ready_subscription_yields_its_batch() {
        let entries = vec![Entry::new(0, Event::new("e", "s", Vec::new()))];
        let sub = Subscription::ready(Ok(entries.clone()));
        assert_eq!(sub.recv().await.unwrap(), entries);
    }

    #[tokio::test]
    async fn dropped_producer_surfaces_as_storage_error() {
        let (tx, rx) = oneshot::channel();
        drop(tx);
        let err = Subscription::new(rx).recv().await.unwrap_err();
        assert!(matches!(err, EventStoreError::Storage(_)));
    }
}

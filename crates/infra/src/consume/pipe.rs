use async_trait::async_trait;

use eventline_events::Entry;

use super::{ConsumeError, Consumer, Context};

/// Runs `first`, then `next`, stopping at the first error.
pub struct Pipe<A, B> {
    first: A,
    next: B,
}

impl<A, B> Pipe<A, B> {
    pub fn new(first: A, next: B) -> Self {
        Self { first, next }
    }
}

#[async_trait]
impl<A, B> Consumer for Pipe<A, B>
where
    A: Consumer,
    B: Consumer,
{
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        self.first.handle(ctx, entries).await?;
        self.next.handle(ctx, entries).await
    }
}

use async_trait::async_trait;
use tracing::{info_span, Instrument};

use eventline_events::Entry;

use super::{ConsumeError, Consumer, Context};

/// Opens one span per entry, labelled `#{pos}@{name} a={aggregate} id={event}`.
///
/// Usually placed in front of the real consumer with a [`Pipe`](super::Pipe).
#[derive(Debug, Clone, Default)]
pub struct TracingFilter;

impl TracingFilter {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn span_label(entry: &Entry) -> String {
    let event = entry.event();
    format!(
        "#{}@{} a={} id={}",
        entry.global_pos(),
        event.name(),
        event.aggregate_id(),
        event.id()
    )
}

#[async_trait]
impl Consumer for TracingFilter {
    async fn handle(&self, ctx: &Context, entries: &[Entry]) -> Result<(), ConsumeError> {
        for entry in entries {
            let span = info_span!(
                "consume",
                subscription = ctx.subscription_id(),
                entry = %span_label(entry)
            );
            async {
                tracing::trace!("entry delivered");
            }
            .instrument(span)
            .await;
        }
        Ok(())
    }
}

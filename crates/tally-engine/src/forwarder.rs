use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tally_core::event::POLL_START_KINDS;
use tally_core::source::LiveEventSource;

use crate::registry::AggregationRegistry;

/// Bridges newly received poll-start events into the registry as live
/// observations. Never touches the timestamp tracker: live events are not
/// part of the backward-walk accounting.
pub struct LiveUpdateForwarder {
    registry: Arc<AggregationRegistry>,
}

impl LiveUpdateForwarder {
    pub fn new(registry: Arc<AggregationRegistry>) -> Self {
        Self { registry }
    }

    /// Subscribe once for the service's lifetime and spawn the forwarding
    /// task. The subscription is taken before spawning so no event received
    /// after this call can be missed.
    pub fn start(
        self,
        source: &dyn LiveEventSource,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut events = source.listen(&POLL_START_KINDS);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = events.next() => match next {
                        Some(event) => {
                            if !event.kind.is_poll_start() {
                                debug!(kind = ?event.kind, "non poll-start event on live stream, ignored");
                                continue;
                            }
                            self.registry.observe(&event, true);
                        }
                        None => {
                            info!("live event source closed");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ImmediateAggregatorFactory, MockLiveEventSource};
    use chrono::Utc;
    use std::time::Duration;
    use tally_core::event::{PollAnswer, PollStartContent, TimelineEvent};
    use tally_core::ids::{RoomId, UserId};
    use tally_core::poll::PollKind;
    use tokio::sync::mpsc;

    fn start_event() -> TimelineEvent {
        TimelineEvent::poll_start(
            RoomId::new(),
            UserId::new(),
            Utc::now(),
            PollStartContent {
                question: "q".into(),
                kind: PollKind::Disclosed,
                max_selections: 1,
                answers: vec![PollAnswer { id: "a".into(), text: "A".into() }],
            },
        )
    }

    fn registry_with_consumer() -> (Arc<AggregationRegistry>, tokio::task::JoinHandle<()>) {
        let factory = Arc::new(ImmediateAggregatorFactory::new());
        let (agg_tx, mut agg_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(AggregationRegistry::new(factory, agg_tx));
        let consumer = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                while let Some(event) = agg_rx.recv().await {
                    registry.apply(event);
                }
            })
        };
        (registry, consumer)
    }

    #[tokio::test]
    async fn live_poll_start_reaches_live_stream() {
        let (registry, _consumer) = registry_with_consumer();
        let source = MockLiveEventSource::new();
        let cancel = CancellationToken::new();
        let mut live_rx = registry.subscribe_live();

        let _task = LiveUpdateForwarder::new(Arc::clone(&registry)).start(&source, cancel);

        let event = start_event();
        source.push(event.clone());

        let details = tokio::time::timeout(Duration::from_secs(1), live_rx.recv())
            .await
            .expect("live poll should publish")
            .unwrap();
        assert_eq!(details.id, event.event_id);
    }

    #[tokio::test]
    async fn cancellation_stops_forwarding() {
        let (registry, _consumer) = registry_with_consumer();
        let source = MockLiveEventSource::new();
        let cancel = CancellationToken::new();

        let task = LiveUpdateForwarder::new(Arc::clone(&registry)).start(&source, cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder should stop")
            .unwrap();

        source.push(start_event());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn source_close_ends_task() {
        let (registry, _consumer) = registry_with_consumer();
        let cancel = CancellationToken::new();
        let task = {
            let source = MockLiveEventSource::new();
            LiveUpdateForwarder::new(Arc::clone(&registry)).start(&source, cancel)
            // source dropped here: the broadcast sender goes away
        };
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("forwarder should stop when the source closes")
            .unwrap();
    }
}

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tally_core::poll::TimelinePollDetails;
use tally_core::source::{LiveEventSource, PollAggregatorFactory, TimelineSource};
use tally_core::stream::BatchStream;

use crate::forwarder::LiveUpdateForwarder;
use crate::paginator::PaginationDriver;
use crate::registry::AggregationRegistry;
use crate::tracker::TimestampTracker;

/// Operating parameters for one room-history session.
#[derive(Clone, Debug)]
pub struct PollHistoryConfig {
    /// How many days of history one batch walks back over.
    pub chunk_size_days: i64,
    /// Events requested per backward page.
    pub page_size: u32,
}

impl Default for PollHistoryConfig {
    fn default() -> Self {
        Self {
            chunk_size_days: 30,
            page_size: 250,
        }
    }
}

/// Poll history for one room: walks the timeline backwards in day-sized
/// chunks to discover historical polls, publishes newly arriving live polls,
/// and surfaces later changes to anything already published.
///
/// Owned by its caller and scoped to the room view; dropping it stops the
/// live subscription, abandons any in-flight batch, and releases every
/// aggregation context.
pub struct PollHistoryService {
    driver: Arc<PaginationDriver>,
    registry: Arc<AggregationRegistry>,
    tracker: Arc<TimestampTracker>,
    timeline: Arc<dyn TimelineSource>,
    cancel: CancellationToken,
}

impl PollHistoryService {
    pub fn new(
        timeline: Arc<dyn TimelineSource>,
        live_source: &dyn LiveEventSource,
        factory: Arc<dyn PollAggregatorFactory>,
        config: PollHistoryConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let (aggregator_tx, aggregator_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(AggregationRegistry::new(factory, aggregator_tx));
        let tracker = Arc::new(TimestampTracker::new(Utc::now()));
        let driver = Arc::new(PaginationDriver::new(
            Arc::clone(&timeline),
            Arc::clone(&tracker),
            Arc::clone(&registry),
            config.chunk_size_days,
            config.page_size,
            cancel.clone(),
        ));

        Self::spawn_aggregator_consumer(Arc::clone(&registry), aggregator_rx, cancel.clone());
        LiveUpdateForwarder::new(Arc::clone(&registry)).start(live_source, cancel.clone());

        Self {
            driver,
            registry,
            tracker,
            timeline,
            cancel,
        }
    }

    /// All aggregator lifecycle events funnel through this one task, so
    /// publication decisions are serialized whichever path produced them.
    fn spawn_aggregator_consumer(
        registry: Arc<AggregationRegistry>,
        mut aggregator_rx: mpsc::UnboundedReceiver<tally_core::stream::AggregatorEvent>,
        cancel: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = aggregator_rx.recv() => match event {
                        Some(event) => registry.apply(event),
                        None => {
                            debug!("aggregator event channel closed");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Discoveries for the next (or currently walking) backward batch.
    pub fn next_batch(&self) -> BatchStream {
        self.driver.next_batch()
    }

    pub fn has_next_batch(&self) -> bool {
        self.timeline.can_paginate_backwards()
    }

    /// Observable oldest timestamp reached by the walks so far.
    pub fn fetched_up_to(&self) -> watch::Receiver<DateTime<Utc>> {
        self.tracker.watch()
    }

    /// One event per newly loaded live poll. Never terminates on its own.
    pub fn live_polls(&self) -> broadcast::Receiver<TimelinePollDetails> {
        self.registry.subscribe_live()
    }

    /// One event per change to any previously published poll, live or
    /// historical. Never terminates on its own.
    pub fn updates(&self) -> broadcast::Receiver<TimelinePollDetails> {
        self.registry.subscribe_updates()
    }
}

impl Drop for PollHistoryService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::LocalAggregatorFactory;
    use crate::mock::{ImmediateAggregatorFactory, MockLiveEventSource, MockRelationSource, MockTimelineSource};
    use chrono::Duration;
    use futures::StreamExt;
    use std::time::Duration as StdDuration;
    use tally_core::error::PaginationError;
    use tally_core::event::{PollAnswer, PollStartContent, TimelineEvent};
    use tally_core::ids::{RoomId, UserId};
    use tally_core::poll::PollKind;
    use tally_core::source::RelationSource;

    fn poll_start_at(ts: DateTime<Utc>, question: &str) -> TimelineEvent {
        TimelineEvent::poll_start(
            RoomId::new(),
            UserId::new(),
            ts,
            PollStartContent {
                question: question.into(),
                kind: PollKind::Disclosed,
                max_selections: 1,
                answers: vec![
                    PollAnswer { id: "yes".into(), text: "Yes".into() },
                    PollAnswer { id: "no".into(), text: "No".into() },
                ],
            },
        )
    }

    fn service_with_pages(
        pages: Vec<Result<Vec<TimelineEvent>, PaginationError>>,
    ) -> (PollHistoryService, Arc<MockTimelineSource>, MockLiveEventSource) {
        let _ = tally_telemetry::try_init_telemetry(&tally_telemetry::TelemetryConfig::default());
        let timeline = Arc::new(MockTimelineSource::new(pages));
        let live = MockLiveEventSource::new();
        let service = PollHistoryService::new(
            Arc::clone(&timeline) as Arc<dyn TimelineSource>,
            &live,
            Arc::new(ImmediateAggregatorFactory::new()),
            PollHistoryConfig::default(),
        );
        (service, timeline, live)
    }

    #[tokio::test]
    async fn batch_yields_historical_polls_then_completes() {
        let now = Utc::now();
        let old = now - Duration::days(35);
        let (service, timeline, _live) = service_with_pages(vec![Ok(vec![
            poll_start_at(old, "one"),
            poll_start_at(old - Duration::hours(1), "two"),
            poll_start_at(old - Duration::hours(2), "three"),
        ])]);

        let polls: Vec<_> = service.next_batch().collect().await;
        assert_eq!(polls.len(), 3);
        assert!(polls.iter().all(|p| p.is_ok()));
        assert!(!service.has_next_batch());
        assert_eq!(timeline.call_count(), 1);
    }

    #[tokio::test]
    async fn live_poll_appears_once_on_live_stream_only() {
        let (service, _timeline, live) = service_with_pages(vec![]);
        let mut live_rx = service.live_polls();
        let mut updates_rx = service.updates();

        let event = poll_start_at(Utc::now(), "fresh");
        live.push(event.clone());

        let details = tokio::time::timeout(StdDuration::from_secs(1), live_rx.recv())
            .await
            .expect("live poll should publish")
            .unwrap();
        assert_eq!(details.id, event.event_id);

        // Exactly once, and nowhere else.
        assert!(live_rx.try_recv().is_err());
        assert!(updates_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn historical_poll_vote_surfaces_on_updates_only() {
        let now = Utc::now();
        let start = poll_start_at(now - Duration::days(2), "dinner");
        let relations = Arc::new(MockRelationSource::new());
        let factory = Arc::new(LocalAggregatorFactory::new(
            Arc::clone(&relations) as Arc<dyn RelationSource>,
            UserId::new(),
        ));
        let timeline = Arc::new(MockTimelineSource::new(vec![Ok(vec![start.clone()])]));
        let live = MockLiveEventSource::new();
        let service = PollHistoryService::new(
            Arc::clone(&timeline) as Arc<dyn TimelineSource>,
            &live,
            Arc::clone(&factory) as Arc<dyn PollAggregatorFactory>,
            PollHistoryConfig::default(),
        );
        let mut live_rx = service.live_polls();
        let mut updates_rx = service.updates();

        let polls: Vec<_> = service.next_batch().collect().await;
        assert_eq!(polls.len(), 1);

        // A vote arrives live after the batch closed.
        factory.ingest(TimelineEvent::poll_response(
            start.room_id.clone(),
            UserId::new(),
            now,
            start.event_id.clone(),
            vec!["yes".into()],
        ));

        let update = tokio::time::timeout(StdDuration::from_secs(1), updates_rx.recv())
            .await
            .expect("vote should surface as an update")
            .unwrap();
        assert_eq!(update.id, start.event_id);
        assert_eq!(update.option("yes").unwrap().count, 1);

        assert!(updates_rx.try_recv().is_err());
        assert!(live_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_page_ends_batch_and_next_call_starts_fresh() {
        let now = Utc::now();
        let (service, _timeline, _live) = service_with_pages(vec![
            Ok(vec![poll_start_at(now - Duration::hours(1), "survivor")]),
            Err(PaginationError::Network("reset".into())),
            Ok(vec![poll_start_at(now - Duration::hours(5), "later")]),
        ]);

        let first: Vec<_> = service.next_batch().collect().await;
        assert!(matches!(first.as_slice(), [Ok(_), Err(_)]));

        let second: Vec<_> = service.next_batch().collect().await;
        assert!(matches!(second.as_slice(), [Ok(_)]));
    }

    #[tokio::test]
    async fn live_echo_of_paginated_poll_publishes_nothing_new() {
        let now = Utc::now();
        let start = poll_start_at(now - Duration::hours(3), "echoed");
        let (service, _timeline, live) = service_with_pages(vec![Ok(vec![start.clone()])]);
        let mut live_rx = service.live_polls();
        let mut updates_rx = service.updates();

        let polls: Vec<_> = service.next_batch().collect().await;
        assert_eq!(polls.len(), 1);

        // The same start event arrives again over the live stream.
        live.push(start.clone());
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        assert!(live_rx.try_recv().is_err());
        assert!(updates_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fetched_up_to_tracks_walk_progress() {
        let now = Utc::now();
        let oldest = now - Duration::days(3);
        let (service, _timeline, _live) = service_with_pages(vec![Ok(vec![
            TimelineEvent::other(RoomId::new(), UserId::new(), oldest, "m.room.message"),
        ])]);
        let mut progress = service.fetched_up_to();

        let _: Vec<_> = service.next_batch().collect().await;
        tokio::time::timeout(StdDuration::from_secs(1), progress.changed())
            .await
            .expect("progress should move")
            .unwrap();
        assert_eq!(*progress.borrow_and_update(), oldest);
    }

    #[tokio::test]
    async fn has_next_batch_mirrors_the_source() {
        let (service, _timeline, _live) =
            service_with_pages(vec![Ok(vec![]), Ok(vec![])]);
        assert!(service.has_next_batch());

        // An empty room never reaches the target; the walk drains the
        // timeline instead and exhaustion shows through afterwards.
        let polls: Vec<_> = service.next_batch().collect().await;
        assert!(polls.is_empty());
        assert!(!service.has_next_batch());
    }

    #[tokio::test]
    async fn drop_stops_live_listening() {
        let (service, _timeline, live) = service_with_pages(vec![]);
        let mut live_rx = service.live_polls();
        drop(service);
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        live.push(poll_start_at(Utc::now(), "after the end"));
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(matches!(
            live_rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed)
        ));
    }
}

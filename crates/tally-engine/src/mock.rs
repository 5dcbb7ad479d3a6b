//! Scripted in-process collaborators for deterministic tests without a
//! homeserver connection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;

use tally_core::error::{AggregatorError, PaginationError};
use tally_core::event::{EventKind, TimelineEvent};
use tally_core::ids::EventId;
use tally_core::poll::TimelinePollDetails;
use tally_core::source::{
    EventStream, LiveEventSource, PollAggregator, PollAggregatorFactory, RelationSource,
    TimelineSource,
};
use tally_core::stream::AggregatorEvent;

/// Timeline source backed by a queue of pre-scripted page results.
/// `can_paginate_backwards` reports false once the queue drains.
pub struct MockTimelineSource {
    pages: Mutex<VecDeque<Result<Vec<TimelineEvent>, PaginationError>>>,
    call_count: AtomicUsize,
}

impl MockTimelineSource {
    pub fn new(pages: Vec<Result<Vec<TimelineEvent>, PaginationError>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TimelineSource for MockTimelineSource {
    async fn paginate_backwards(
        &self,
        _page_size: u32,
    ) -> Result<Vec<TimelineEvent>, PaginationError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.pages.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }

    fn can_paginate_backwards(&self) -> bool {
        !self.pages.lock().is_empty()
    }
}

/// Live event source tests push into by hand.
pub struct MockLiveEventSource {
    tx: broadcast::Sender<TimelineEvent>,
}

impl MockLiveEventSource {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn push(&self, event: TimelineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for MockLiveEventSource {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveEventSource for MockLiveEventSource {
    fn listen(&self, kinds: &[EventKind]) -> EventStream {
        let kinds = kinds.to_vec();
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(move |received| {
            futures::future::ready(match received {
                Ok(event) if kinds.contains(&event.kind) => Some(event),
                _ => None,
            })
        }))
    }
}

/// Relation lookup backed by a plain map; individual parents can be
/// scripted to fail.
pub struct MockRelationSource {
    relations: Mutex<HashMap<EventId, Vec<TimelineEvent>>>,
    failing: Mutex<HashSet<EventId>>,
}

impl MockRelationSource {
    pub fn new() -> Self {
        Self {
            relations: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn insert(&self, parent: EventId, events: Vec<TimelineEvent>) {
        self.relations.lock().insert(parent, events);
    }

    pub fn fail_for(&self, parent: EventId) {
        self.failing.lock().insert(parent);
    }
}

impl Default for MockRelationSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationSource for MockRelationSource {
    async fn relations(
        &self,
        event_id: &EventId,
    ) -> Result<Vec<TimelineEvent>, AggregatorError> {
        if self.failing.lock().contains(event_id) {
            return Err(AggregatorError::RelationFetch("scripted failure".into()));
        }
        Ok(self.relations.lock().get(event_id).cloned().unwrap_or_default())
    }
}

/// Aggregator frozen at its start-only snapshot.
pub struct StaticPollAggregator {
    details: TimelinePollDetails,
}

impl PollAggregator for StaticPollAggregator {
    fn poll(&self) -> TimelinePollDetails {
        self.details.clone()
    }
}

/// Factory that skips relation loading entirely. In auto-load mode it
/// reports `Loading` and `Loaded` at build time; in manual mode the test
/// drives the lifecycle channel itself.
pub struct ImmediateAggregatorFactory {
    auto_load: bool,
    fail_builds_for: Mutex<HashSet<EventId>>,
    built: AtomicUsize,
}

impl ImmediateAggregatorFactory {
    pub fn new() -> Self {
        Self {
            auto_load: true,
            fail_builds_for: Mutex::new(HashSet::new()),
            built: AtomicUsize::new(0),
        }
    }

    pub fn manual() -> Self {
        Self {
            auto_load: false,
            ..Self::new()
        }
    }

    /// Script a construction failure for the next build of the given
    /// poll-start event id; builds after that succeed again.
    pub fn fail_next_build_for(&self, event_id: EventId) {
        self.fail_builds_for.lock().insert(event_id);
    }

    pub fn built_count(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }
}

impl Default for ImmediateAggregatorFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl PollAggregatorFactory for ImmediateAggregatorFactory {
    fn build(
        &self,
        start: &TimelineEvent,
        events: mpsc::UnboundedSender<AggregatorEvent>,
    ) -> Result<Box<dyn PollAggregator>, AggregatorError> {
        if self.fail_builds_for.lock().remove(&start.event_id) {
            return Err(AggregatorError::MalformedEvent(start.event_id.clone()));
        }
        let details = TimelinePollDetails::from_start_event(start)
            .ok_or_else(|| AggregatorError::NotAPollStart(start.event_id.clone()))?;
        self.built.fetch_add(1, Ordering::Relaxed);

        if self.auto_load {
            let poll_id = start.event_id.clone();
            let _ = events.send(AggregatorEvent::Loading { poll_id: poll_id.clone() });
            let _ = events.send(AggregatorEvent::Loaded { poll_id });
        }
        Ok(Box::new(StaticPollAggregator { details }))
    }
}

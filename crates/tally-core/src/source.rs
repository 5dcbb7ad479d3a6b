use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{AggregatorError, PaginationError};
use crate::event::{EventKind, TimelineEvent};
use crate::ids::EventId;
use crate::poll::TimelinePollDetails;
use crate::stream::AggregatorEvent;

pub type EventStream = Pin<Box<dyn Stream<Item = TimelineEvent> + Send>>;

/// A room timeline that can be walked backwards one page at a time.
///
/// `paginate_backwards` resolves only after the whole page has been fetched
/// (including events not yet locally cached); the returned events are in
/// arrival order. The caller processes them fully before requesting the
/// next page.
#[async_trait]
pub trait TimelineSource: Send + Sync {
    async fn paginate_backwards(
        &self,
        page_size: u32,
    ) -> Result<Vec<TimelineEvent>, PaginationError>;

    fn can_paginate_backwards(&self) -> bool;
}

/// Room-scoped push source for newly received events. Fires once per
/// matching event for the lifetime of the subscription.
pub trait LiveEventSource: Send + Sync {
    fn listen(&self, kinds: &[EventKind]) -> EventStream;
}

/// Looks up all locally known events relating to a given event id, e.g. a
/// poll's responses and end events.
#[async_trait]
pub trait RelationSource: Send + Sync {
    async fn relations(&self, event_id: &EventId)
        -> Result<Vec<TimelineEvent>, AggregatorError>;
}

/// Owns one poll's full event history and exposes its current snapshot.
/// Lifecycle is reported over the `AggregatorEvent` channel supplied at
/// construction; the snapshot is readable at any time after construction.
pub trait PollAggregator: Send + Sync {
    fn poll(&self) -> TimelinePollDetails;
}

/// Builds one aggregator per unique poll-start event. Construction is
/// synchronous and fallible; a failure means the event never becomes a
/// published poll.
pub trait PollAggregatorFactory: Send + Sync {
    fn build(
        &self,
        start: &TimelineEvent,
        events: mpsc::UnboundedSender<AggregatorEvent>,
    ) -> Result<Box<dyn PollAggregator>, AggregatorError>;
}

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use tally_core::source::TimelineSource;
use tally_core::stream::{BatchEvent, BatchStream};

use crate::registry::AggregationRegistry;
use crate::tracker::TimestampTracker;

const BATCH_CHANNEL_CAPACITY: usize = 128;

/// Drives one backward walk at a time: page by page until either the
/// batch's target timestamp is passed or the timeline is exhausted.
pub struct PaginationDriver {
    source: Arc<dyn TimelineSource>,
    tracker: Arc<TimestampTracker>,
    registry: Arc<AggregationRegistry>,
    chunk_size_days: i64,
    page_size: u32,
    /// Sender of the open batch; `None` while idle. Single-flight: a
    /// second `next_batch` call joins this walk instead of starting one.
    in_flight: Mutex<Option<broadcast::Sender<BatchEvent>>>,
    cancel: CancellationToken,
}

impl PaginationDriver {
    pub fn new(
        source: Arc<dyn TimelineSource>,
        tracker: Arc<TimestampTracker>,
        registry: Arc<AggregationRegistry>,
        chunk_size_days: i64,
        page_size: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            tracker,
            registry,
            chunk_size_days,
            page_size,
            in_flight: Mutex::new(None),
            cancel,
        }
    }

    /// Start the next backward batch, or join the one already walking.
    pub fn next_batch(self: &Arc<Self>) -> BatchStream {
        let mut in_flight = self.in_flight.lock();
        if let Some(tx) = in_flight.as_ref() {
            debug!("batch already in flight, joining it");
            return BatchStream::new(tx.subscribe());
        }

        let (tx, rx) = broadcast::channel(BATCH_CHANNEL_CAPACITY);
        *in_flight = Some(tx.clone());
        self.registry.open_batch(tx.clone());
        // The target must be fixed before the first page request so events
        // from this very batch cannot move it.
        self.tracker.begin_batch(self.chunk_size_days);

        let driver = Arc::clone(self);
        tokio::spawn(async move { driver.run_batch(tx).await });
        BatchStream::new(rx)
    }

    #[instrument(skip_all, fields(chunk_days = self.chunk_size_days, page_size = self.page_size))]
    async fn run_batch(&self, tx: broadcast::Sender<BatchEvent>) {
        let Some(outcome) = self.walk().await else {
            self.abandon();
            return;
        };

        self.registry.close_batch();
        *self.in_flight.lock() = None;
        if tx.send(outcome).is_err() {
            debug!("no batch subscribers at termination");
        }
    }

    /// The pagination loop. Returns the terminal event, or `None` when the
    /// walk was cancelled and the batch should be abandoned.
    async fn walk(&self) -> Option<BatchEvent> {
        loop {
            let page = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                page = self.source.paginate_backwards(self.page_size) => page,
            };

            let events = match page {
                Ok(events) => events,
                Err(error) => {
                    warn!(error = %error, kind = error.error_kind(), "backward page fetch failed");
                    return Some(BatchEvent::Failed(error));
                }
            };

            // Page processing is synchronous: the continue/stop decision
            // below must see every timestamp this page delivered.
            for event in &events {
                self.tracker.record_event(event.origin_ts);
                if event.kind.is_poll_start() {
                    self.registry.observe(event, false);
                }
            }

            // Polls this page discovered finish loading and publish before
            // the walk moves on, so a later page failure or the terminal
            // event can never overtake their discoveries on the stream.
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = self.registry.wait_for_historical_loads() => {}
            }

            if self.tracker.target_reached() || !self.source.can_paginate_backwards() {
                return Some(BatchEvent::Completed);
            }
        }
    }

    /// Drop the batch without a terminal event (service disposal mid-walk).
    fn abandon(&self) {
        self.registry.close_batch();
        *self.in_flight.lock() = None;
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.lock().is_none()
    }
}

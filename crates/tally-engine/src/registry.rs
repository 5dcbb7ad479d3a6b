use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use tally_core::event::TimelineEvent;
use tally_core::ids::EventId;
use tally_core::poll::TimelinePollDetails;
use tally_core::source::{PollAggregator, PollAggregatorFactory};
use tally_core::stream::{AggregatorEvent, BatchEvent};

const LIVE_CHANNEL_CAPACITY: usize = 64;
const UPDATES_CHANNEL_CAPACITY: usize = 64;

/// Bookkeeping for one poll: its aggregator, which source first observed
/// it, and whether its snapshot has been announced yet.
struct PollAggregationContext {
    aggregator: Box<dyn PollAggregator>,
    /// Fixed at creation from the first observing source; a later
    /// observation from the other source never reclassifies the poll.
    is_live: bool,
    published: bool,
    /// Whether the initial load has come to rest (loaded or failed).
    load_settled: bool,
}

/// Owns the one-to-one mapping from poll-start event id to aggregation
/// context. Guarantees idempotent discovery and at-most-once publication
/// per poll across the batch and live streams.
///
/// `apply` is driven from a single consumer task; `observe` may be called
/// from the pagination walk and the live forwarder concurrently; the map's
/// per-entry locking keeps each poll's bookkeeping consistent.
pub struct AggregationRegistry {
    contexts: DashMap<EventId, PollAggregationContext>,
    factory: Arc<dyn PollAggregatorFactory>,
    aggregator_tx: mpsc::UnboundedSender<AggregatorEvent>,
    /// Sender of the currently open batch, parked here by the pagination
    /// driver for the duration of the walk.
    batch_tx: RwLock<Option<broadcast::Sender<BatchEvent>>>,
    live_tx: broadcast::Sender<TimelinePollDetails>,
    updates_tx: broadcast::Sender<TimelinePollDetails>,
    /// Historical contexts whose initial load has not settled yet. The
    /// driver waits for zero before completing a batch, so every poll the
    /// walk discovered is published inside that batch.
    pending_historical: watch::Sender<usize>,
}

impl AggregationRegistry {
    pub fn new(
        factory: Arc<dyn PollAggregatorFactory>,
        aggregator_tx: mpsc::UnboundedSender<AggregatorEvent>,
    ) -> Self {
        let (live_tx, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let (updates_tx, _) = broadcast::channel(UPDATES_CHANNEL_CAPACITY);
        let (pending_historical, _) = watch::channel(0);
        Self {
            contexts: DashMap::new(),
            factory,
            aggregator_tx,
            batch_tx: RwLock::new(None),
            live_tx,
            updates_tx,
            pending_historical,
        }
    }

    /// Record a poll-start discovery. Duplicate discovery of the same event
    /// id is a no-op, whichever source it came from: the first observation
    /// wins, classification included.
    ///
    /// Aggregator construction failures are swallowed here: the event id
    /// is left unregistered so a later, corrected event for the same id can
    /// retry, and the rest of the page keeps processing.
    pub fn observe(&self, event: &TimelineEvent, is_live: bool) {
        if !event.kind.is_poll_start() {
            return;
        }
        match self.contexts.entry(event.event_id.clone()) {
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                match self.factory.build(event, self.aggregator_tx.clone()) {
                    Ok(aggregator) => {
                        if !is_live {
                            self.pending_historical.send_modify(|n| *n += 1);
                        }
                        slot.insert(PollAggregationContext {
                            aggregator,
                            is_live,
                            published: false,
                            load_settled: false,
                        });
                    }
                    Err(error) => {
                        debug!(
                            event_id = %event.event_id,
                            error = %error,
                            "aggregator construction failed, poll skipped"
                        );
                    }
                }
            }
        }
    }

    /// Consume one aggregator lifecycle event. Called from a single task.
    pub fn apply(&self, event: AggregatorEvent) {
        match event {
            AggregatorEvent::Loaded { poll_id } => self.on_loaded(&poll_id),
            AggregatorEvent::Updated { poll_id } => self.on_updated(&poll_id),
            AggregatorEvent::Failed { poll_id, error } => {
                warn!(poll_id = %poll_id, error = %error, "poll aggregation failed");
                self.settle_load(&poll_id);
            }
            AggregatorEvent::Loading { poll_id } => {
                debug!(poll_id = %poll_id, "poll aggregation started");
            }
        }
    }

    fn on_loaded(&self, poll_id: &EventId) {
        let Some(mut context) = self.contexts.get_mut(poll_id) else {
            debug!(poll_id = %poll_id, "loaded callback for unknown poll, ignored");
            return;
        };
        if context.published {
            return;
        }
        context.published = true;
        let already_settled = context.load_settled;
        context.load_settled = true;
        let is_live = context.is_live;
        let details = context.aggregator.poll();
        drop(context);

        if is_live {
            if self.live_tx.send(details).is_err() {
                debug!(poll_id = %poll_id, "no live poll subscribers, dropped");
            }
        } else {
            match self.batch_tx.read().as_ref() {
                Some(tx) => {
                    let _ = tx.send(BatchEvent::Poll(details));
                }
                None => {
                    debug!(poll_id = %poll_id, "historical poll loaded with no open batch, dropped");
                }
            }
            // Only after the snapshot is on the batch channel may the walk
            // consider this load settled; the terminal event must not
            // overtake it.
            if !already_settled {
                self.pending_historical.send_modify(|n| *n = n.saturating_sub(1));
            }
        }
    }

    fn on_updated(&self, poll_id: &EventId) {
        let Some(context) = self.contexts.get(poll_id) else {
            debug!(poll_id = %poll_id, "update for unknown poll, ignored");
            return;
        };
        if !context.published {
            debug!(poll_id = %poll_id, "update before publication, ignored");
            return;
        }
        let details = context.aggregator.poll();
        drop(context);

        if self.updates_tx.send(details).is_err() {
            debug!(poll_id = %poll_id, "no update subscribers, dropped");
        }
    }

    fn settle_load(&self, poll_id: &EventId) {
        let Some(mut context) = self.contexts.get_mut(poll_id) else {
            return;
        };
        if context.load_settled {
            return;
        }
        context.load_settled = true;
        let is_live = context.is_live;
        drop(context);

        if !is_live {
            self.pending_historical.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    pub fn open_batch(&self, tx: broadcast::Sender<BatchEvent>) {
        *self.batch_tx.write() = Some(tx);
    }

    pub fn close_batch(&self) {
        *self.batch_tx.write() = None;
    }

    /// Resolves once every historical context created so far has settled
    /// its initial load. Live contexts never gate this: a stalled live
    /// aggregator must not stall the walk.
    pub async fn wait_for_historical_loads(&self) {
        let mut rx = self.pending_historical.subscribe();
        loop {
            if *rx.borrow_and_update() == 0 {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<TimelinePollDetails> {
        self.live_tx.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<TimelinePollDetails> {
        self.updates_tx.subscribe()
    }

    pub fn contains(&self, poll_id: &EventId) -> bool {
        self.contexts.contains_key(poll_id)
    }

    pub fn count(&self) -> usize {
        self.contexts.len()
    }
}

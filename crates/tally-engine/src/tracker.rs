use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Tracks how far back the walk has reached. `oldest` is the minimum
/// originating timestamp across every event observed while paginating;
/// `target` is the boundary the current batch stops at.
pub struct TimestampTracker {
    oldest_tx: watch::Sender<DateTime<Utc>>,
    target: Mutex<Option<DateTime<Utc>>>,
}

impl TimestampTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        let (oldest_tx, _) = watch::channel(now);
        Self {
            oldest_tx,
            target: Mutex::new(None),
        }
    }

    /// Called for every paginated event, not only poll starts: the stopping
    /// condition is the age of the oldest event seen, whatever its type.
    pub fn record_event(&self, ts: DateTime<Utc>) {
        self.oldest_tx.send_if_modified(|oldest| {
            if ts < *oldest {
                *oldest = ts;
                true
            } else {
                false
            }
        });
    }

    /// Fix the batch's target. Must run synchronously before the batch's
    /// first page request so events from that batch cannot move the target.
    pub fn begin_batch(&self, chunk_size_days: i64) {
        let starting = *self.oldest_tx.borrow();
        *self.target.lock() = Some(starting - Duration::days(chunk_size_days));
    }

    pub fn target_reached(&self) -> bool {
        match *self.target.lock() {
            Some(target) => *self.oldest_tx.borrow() <= target,
            None => false,
        }
    }

    pub fn oldest(&self) -> DateTime<Utc> {
        *self.oldest_tx.borrow()
    }

    /// Observable progress for "fetched up to" indicators.
    pub fn watch(&self) -> watch::Receiver<DateTime<Utc>> {
        self.oldest_tx.subscribe()
    }
}

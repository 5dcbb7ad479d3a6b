use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tally_core::error::AggregatorError;
use tally_core::event::{EventContent, PollStartContent, TimelineEvent};
use tally_core::ids::{EventId, UserId};
use tally_core::poll::{PollAnswerOption, PollKind, TimelinePollDetails};
use tally_core::source::{PollAggregator, PollAggregatorFactory, RelationSource};
use tally_core::stream::AggregatorEvent;

const ROOM_TAP_CAPACITY: usize = 256;

/// One user's current vote. An empty selection list is a spoiled vote and
/// retracts the user's previous one.
struct Vote {
    ts: DateTime<Utc>,
    event_id: EventId,
    selections: Vec<String>,
}

/// Full fold state for one poll.
struct PollState {
    poll_id: EventId,
    start: PollStartContent,
    start_date: DateTime<Utc>,
    own_user: UserId,
    responses: HashMap<UserId, Vote>,
    ended_at: Option<DateTime<Utc>>,
}

impl PollState {
    fn new(start_event: &TimelineEvent, start: PollStartContent, own_user: UserId) -> Self {
        Self {
            poll_id: start_event.event_id.clone(),
            start,
            start_date: start_event.origin_ts,
            own_user,
            responses: HashMap::new(),
            ended_at: None,
        }
    }

    /// Fold one related event into the tally. Returns whether the snapshot
    /// changed. Folding the same event twice is a no-op, so an event seen
    /// both in the initial relations and on the live tap cannot double-count.
    fn fold(&mut self, event: &TimelineEvent) -> bool {
        if event.relates_to.as_ref() != Some(&self.poll_id) {
            return false;
        }
        if event.kind.is_poll_response() {
            self.fold_response(event)
        } else if event.kind.is_poll_end() {
            self.fold_end(event)
        } else {
            false
        }
    }

    fn fold_response(&mut self, event: &TimelineEvent) -> bool {
        let EventContent::PollResponse(content) = &event.content else {
            return false;
        };
        if let Some(end) = self.ended_at {
            // Votes cast after the poll closed don't count.
            if event.origin_ts > end {
                return false;
            }
        }
        let newer = match self.responses.get(&event.sender) {
            Some(existing) => {
                (event.origin_ts, &event.event_id) > (existing.ts, &existing.event_id)
            }
            None => true,
        };
        if !newer {
            return false;
        }
        let selections = self.sanitize(&content.selections);
        self.responses.insert(
            event.sender.clone(),
            Vote {
                ts: event.origin_ts,
                event_id: event.event_id.clone(),
                selections,
            },
        );
        true
    }

    fn fold_end(&mut self, event: &TimelineEvent) -> bool {
        match self.ended_at {
            // The earliest end event wins.
            Some(current) if current <= event.origin_ts => false,
            _ => {
                self.ended_at = Some(event.origin_ts);
                true
            }
        }
    }

    /// Keep only selections naming a declared answer, drop duplicates, and
    /// cap at the poll's selection limit. An empty result is a spoiled vote.
    fn sanitize(&self, selections: &[String]) -> Vec<String> {
        let mut seen = Vec::new();
        for selection in selections {
            if self.start.answers.iter().any(|a| &a.id == selection)
                && !seen.contains(selection)
            {
                seen.push(selection.clone());
                if seen.len() as u32 == self.start.max_selections {
                    break;
                }
            }
        }
        seen
    }

    fn snapshot(&self) -> TimelinePollDetails {
        let end = self.ended_at;
        let counted: Vec<&Vote> = self
            .responses
            .values()
            .filter(|vote| {
                !vote.selections.is_empty() && end.map_or(true, |e| vote.ts <= e)
            })
            .collect();

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for vote in &counted {
            for selection in &vote.selections {
                *counts.entry(selection.as_str()).or_default() += 1;
            }
        }

        let closed = end.is_some();
        // Undisclosed polls hide per-option tallies until they close.
        let disclose = closed || self.start.kind == PollKind::Disclosed;
        let max_count = counts.values().copied().max().unwrap_or(0);
        let own_selections = self
            .responses
            .get(&self.own_user)
            .filter(|vote| end.map_or(true, |e| vote.ts <= e))
            .map(|vote| vote.selections.as_slice())
            .unwrap_or(&[]);

        TimelinePollDetails {
            id: self.poll_id.clone(),
            question: self.start.question.clone(),
            kind: self.start.kind,
            max_allowed_selections: self.start.max_selections,
            answer_options: self
                .start
                .answers
                .iter()
                .map(|answer| {
                    let count = counts.get(answer.id.as_str()).copied().unwrap_or(0);
                    PollAnswerOption {
                        id: answer.id.clone(),
                        text: answer.text.clone(),
                        count: if disclose { count } else { 0 },
                        winner: closed && count == max_count && max_count > 0,
                        selected: own_selections.contains(&answer.id),
                    }
                })
                .collect(),
            closed,
            start_date: self.start_date,
            total_answer_count: counted.len() as u32,
        }
    }
}

/// Aggregator folding a poll's relations and live room events into a
/// consistent snapshot. Dropping it cancels its background task.
pub struct LocalPollAggregator {
    state: Arc<Mutex<PollState>>,
    cancel: CancellationToken,
}

impl PollAggregator for LocalPollAggregator {
    fn poll(&self) -> TimelinePollDetails {
        self.state.lock().snapshot()
    }
}

impl Drop for LocalPollAggregator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builds [`LocalPollAggregator`]s. The host feeds every room event it
/// receives into [`ingest`](Self::ingest); each aggregator picks the
/// responses and ends addressed to its poll off that tap.
pub struct LocalAggregatorFactory {
    relations: Arc<dyn RelationSource>,
    room_events: broadcast::Sender<TimelineEvent>,
    own_user: UserId,
}

impl LocalAggregatorFactory {
    pub fn new(relations: Arc<dyn RelationSource>, own_user: UserId) -> Self {
        let (room_events, _) = broadcast::channel(ROOM_TAP_CAPACITY);
        Self {
            relations,
            room_events,
            own_user,
        }
    }

    /// Push a newly received room event to every aggregator.
    pub fn ingest(&self, event: TimelineEvent) {
        // No aggregators alive is fine; the send just has no receivers.
        let _ = self.room_events.send(event);
    }
}

impl PollAggregatorFactory for LocalAggregatorFactory {
    fn build(
        &self,
        start: &TimelineEvent,
        events: mpsc::UnboundedSender<AggregatorEvent>,
    ) -> Result<Box<dyn PollAggregator>, AggregatorError> {
        if !start.kind.is_poll_start() {
            return Err(AggregatorError::NotAPollStart(start.event_id.clone()));
        }
        let Some(content) = start.poll_start_content() else {
            return Err(AggregatorError::MalformedEvent(start.event_id.clone()));
        };
        if content.question.is_empty() || content.answers.is_empty() || content.max_selections == 0
        {
            return Err(AggregatorError::MalformedEvent(start.event_id.clone()));
        }

        let state = Arc::new(Mutex::new(PollState::new(
            start,
            content.clone(),
            self.own_user.clone(),
        )));
        let cancel = CancellationToken::new();

        // Subscribe before the initial fetch so an update arriving while
        // the relations load is buffered, not lost.
        let mut live_rx = self.room_events.subscribe();
        let relations = Arc::clone(&self.relations);
        let poll_id = start.event_id.clone();
        let task_state = Arc::clone(&state);
        let task_cancel = cancel.clone();

        tokio::spawn(async move {
            let _ = events.send(AggregatorEvent::Loading { poll_id: poll_id.clone() });

            let related = tokio::select! {
                _ = task_cancel.cancelled() => return,
                related = relations.relations(&poll_id) => related,
            };
            match related {
                Ok(related) => {
                    {
                        let mut state = task_state.lock();
                        for event in &related {
                            state.fold(event);
                        }
                    }
                    let _ = events.send(AggregatorEvent::Loaded { poll_id: poll_id.clone() });
                }
                Err(error) => {
                    warn!(poll_id = %poll_id, error = %error, "initial poll load failed");
                    let _ = events.send(AggregatorEvent::Failed { poll_id, error });
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    received = live_rx.recv() => match received {
                        Ok(event) => {
                            let changed = task_state.lock().fold(&event);
                            if changed {
                                let _ = events.send(AggregatorEvent::Updated {
                                    poll_id: poll_id.clone(),
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(poll_id = %poll_id, skipped, "room tap lagged, votes may be stale");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!(poll_id = %poll_id, "room tap closed");
                            break;
                        }
                    }
                }
            }
        });

        Ok(Box::new(LocalPollAggregator { state, cancel }))
    }
}

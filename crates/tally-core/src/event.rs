use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{EventId, RoomId, UserId};
use crate::poll::PollKind;

/// Room event types the engine cares about. The poll types exist under both
/// their stable and unstable wire identifiers; both generations must be
/// recognized when walking old history.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PollStart,
    PollStartUnstable,
    PollResponse,
    PollResponseUnstable,
    PollEnd,
    PollEndUnstable,
    Other(String),
}

/// Kinds a live subscription must cover to see every new poll.
pub const POLL_START_KINDS: [EventKind; 2] = [EventKind::PollStart, EventKind::PollStartUnstable];

impl EventKind {
    pub fn as_wire(&self) -> &str {
        match self {
            Self::PollStart => "m.poll.start",
            Self::PollStartUnstable => "org.matrix.msc3381.poll.start",
            Self::PollResponse => "m.poll.response",
            Self::PollResponseUnstable => "org.matrix.msc3381.poll.response",
            Self::PollEnd => "m.poll.end",
            Self::PollEndUnstable => "org.matrix.msc3381.poll.end",
            Self::Other(s) => s,
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "m.poll.start" => Self::PollStart,
            "org.matrix.msc3381.poll.start" => Self::PollStartUnstable,
            "m.poll.response" => Self::PollResponse,
            "org.matrix.msc3381.poll.response" => Self::PollResponseUnstable,
            "m.poll.end" => Self::PollEnd,
            "org.matrix.msc3381.poll.end" => Self::PollEndUnstable,
            other => Self::Other(other.to_owned()),
        }
    }

    pub fn is_poll_start(&self) -> bool {
        matches!(self, Self::PollStart | Self::PollStartUnstable)
    }

    pub fn is_poll_response(&self) -> bool {
        matches!(self, Self::PollResponse | Self::PollResponseUnstable)
    }

    pub fn is_poll_end(&self) -> bool {
        matches!(self, Self::PollEnd | Self::PollEndUnstable)
    }
}

/// One answer option as declared by the poll-start event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollAnswer {
    pub id: String,
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PollStartContent {
    pub question: String,
    pub kind: PollKind,
    pub max_selections: u32,
    pub answers: Vec<PollAnswer>,
}

/// A vote. Selections reference answer ids; an empty or fully invalid
/// selection list is a spoiled vote and retracts the sender's previous one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResponseContent {
    pub selections: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PollEndContent {
    pub text: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum EventContent {
    PollStart(PollStartContent),
    PollResponse(PollResponseContent),
    PollEnd(PollEndContent),
    Other(serde_json::Value),
}

/// A single room timeline event, as delivered by either the backward
/// pagination source or the live event source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub event_id: EventId,
    pub room_id: RoomId,
    pub sender: UserId,
    pub kind: EventKind,
    pub origin_ts: DateTime<Utc>,
    /// For responses and ends: the poll-start event they relate to.
    pub relates_to: Option<EventId>,
    pub content: EventContent,
}

impl TimelineEvent {
    pub fn poll_start(
        room_id: RoomId,
        sender: UserId,
        origin_ts: DateTime<Utc>,
        content: PollStartContent,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            room_id,
            sender,
            kind: EventKind::PollStart,
            origin_ts,
            relates_to: None,
            content: EventContent::PollStart(content),
        }
    }

    pub fn poll_response(
        room_id: RoomId,
        sender: UserId,
        origin_ts: DateTime<Utc>,
        poll_id: EventId,
        selections: Vec<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            room_id,
            sender,
            kind: EventKind::PollResponse,
            origin_ts,
            relates_to: Some(poll_id),
            content: EventContent::PollResponse(PollResponseContent { selections }),
        }
    }

    pub fn poll_end(
        room_id: RoomId,
        sender: UserId,
        origin_ts: DateTime<Utc>,
        poll_id: EventId,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            room_id,
            sender,
            kind: EventKind::PollEnd,
            origin_ts,
            relates_to: Some(poll_id),
            content: EventContent::PollEnd(PollEndContent::default()),
        }
    }

    /// An event of no interest to the poll engine; used to exercise
    /// timestamp accounting, which covers every paginated event.
    pub fn other(
        room_id: RoomId,
        sender: UserId,
        origin_ts: DateTime<Utc>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            room_id,
            sender,
            kind: EventKind::Other(kind.into()),
            origin_ts,
            relates_to: None,
            content: EventContent::Other(serde_json::Value::Null),
        }
    }

    pub fn poll_start_content(&self) -> Option<&PollStartContent> {
        match &self.content {
            EventContent::PollStart(c) => Some(c),
            _ => None,
        }
    }
}

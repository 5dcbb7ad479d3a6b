use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::TimelineEvent;
use crate::ids::EventId;

/// Whether per-option tallies are visible while the poll is still open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollKind {
    Disclosed,
    Undisclosed,
}

/// One answer option with its current tally.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollAnswerOption {
    pub id: String,
    pub text: String,
    pub count: u32,
    /// Set on the highest-count option(s) once the poll is closed.
    pub winner: bool,
    /// Whether the local user's current vote includes this option.
    pub selected: bool,
}

/// Immutable snapshot of one poll's current state, re-read from its
/// aggregator on every notification. Subscribers never see partial updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelinePollDetails {
    /// Id of the poll-start event that introduced the poll.
    pub id: EventId,
    pub question: String,
    pub kind: PollKind,
    pub max_allowed_selections: u32,
    pub answer_options: Vec<PollAnswerOption>,
    pub closed: bool,
    pub start_date: DateTime<Utc>,
    /// Number of users with a currently valid (non-spoiled) vote.
    pub total_answer_count: u32,
}

impl TimelinePollDetails {
    /// Start-only snapshot: the poll as introduced by its start event,
    /// before any responses have been folded in.
    pub fn from_start_event(event: &TimelineEvent) -> Option<Self> {
        let content = event.poll_start_content()?;
        Some(Self {
            id: event.event_id.clone(),
            question: content.question.clone(),
            kind: content.kind,
            max_allowed_selections: content.max_selections,
            answer_options: content
                .answers
                .iter()
                .map(|a| PollAnswerOption {
                    id: a.id.clone(),
                    text: a.text.clone(),
                    count: 0,
                    winner: false,
                    selected: false,
                })
                .collect(),
            closed: false,
            start_date: event.origin_ts,
            total_answer_count: 0,
        })
    }

    pub fn option(&self, id: &str) -> Option<&PollAnswerOption> {
        self.answer_options.iter().find(|o| o.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TimelinePollDetails {
        TimelinePollDetails {
            id: EventId::new(),
            question: "Lunch?".into(),
            kind: PollKind::Disclosed,
            max_allowed_selections: 1,
            answer_options: vec![
                PollAnswerOption {
                    id: "a".into(),
                    text: "Pizza".into(),
                    count: 2,
                    winner: false,
                    selected: true,
                },
                PollAnswerOption {
                    id: "b".into(),
                    text: "Sushi".into(),
                    count: 1,
                    winner: false,
                    selected: false,
                },
            ],
            closed: false,
            start_date: Utc::now(),
            total_answer_count: 3,
        }
    }

    #[test]
    fn option_lookup() {
        let details = sample();
        assert_eq!(details.option("a").unwrap().text, "Pizza");
        assert!(details.option("missing").is_none());
    }

    #[test]
    fn serde_roundtrip() {
        let details = sample();
        let json = serde_json::to_string(&details).unwrap();
        let parsed: TimelinePollDetails = serde_json::from_str(&json).unwrap();
        assert_eq!(details, parsed);
    }

    #[test]
    fn start_only_snapshot() {
        use crate::event::{PollAnswer, PollStartContent};
        use crate::ids::{RoomId, UserId};

        let event = TimelineEvent::poll_start(
            RoomId::new(),
            UserId::new(),
            Utc::now(),
            PollStartContent {
                question: "Favourite season?".into(),
                kind: PollKind::Undisclosed,
                max_selections: 2,
                answers: vec![
                    PollAnswer { id: "w".into(), text: "Winter".into() },
                    PollAnswer { id: "s".into(), text: "Summer".into() },
                ],
            },
        );
        let details = TimelinePollDetails::from_start_event(&event).unwrap();
        assert_eq!(details.id, event.event_id);
        assert_eq!(details.question, "Favourite season?");
        assert_eq!(details.max_allowed_selections, 2);
        assert!(!details.closed);
        assert_eq!(details.total_answer_count, 0);
        assert!(details.answer_options.iter().all(|o| o.count == 0 && !o.winner));

        let not_a_start =
            TimelineEvent::other(RoomId::new(), UserId::new(), Utc::now(), "m.room.message");
        assert!(TimelinePollDetails::from_start_event(&not_a_start).is_none());
    }

    #[test]
    fn poll_kind_serde() {
        assert_eq!(
            serde_json::to_string(&PollKind::Undisclosed).unwrap(),
            "\"undisclosed\""
        );
    }
}

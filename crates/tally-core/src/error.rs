use crate::ids::EventId;

/// Failures of a backward page fetch. These are the only errors surfaced to
/// the caller; a failing page terminates the current batch and nothing else.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PaginationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("timeline source closed")]
    SourceClosed,
}

impl PaginationError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Server { .. } => "server",
            Self::SourceClosed => "source_closed",
        }
    }
}

/// Failures local to one poll's aggregator. Never propagated past the
/// registry; the offending poll is skipped and the walk continues.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AggregatorError {
    #[error("malformed poll start event {0}")]
    MalformedEvent(EventId),
    #[error("event {0} is not a poll start")]
    NotAPollStart(EventId),
    #[error("relation fetch failed: {0}")]
    RelationFetch(String),
}

impl AggregatorError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent(_) => "malformed_event",
            Self::NotAPollStart(_) => "not_a_poll_start",
            Self::RelationFetch(_) => "relation_fetch",
        }
    }
}

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{AggregatorError, PaginationError};
use crate::ids::EventId;
use crate::poll::TimelinePollDetails;

/// Lifecycle notifications raised by a poll aggregator, consumed by the
/// registry on a single serialized task. `Loaded` fires once when the
/// initial load completes; `Updated` fires for every later change.
#[derive(Clone, Debug)]
pub enum AggregatorEvent {
    Loading { poll_id: EventId },
    Loaded { poll_id: EventId },
    Updated { poll_id: EventId },
    Failed { poll_id: EventId, error: AggregatorError },
}

impl AggregatorEvent {
    pub fn poll_id(&self) -> &EventId {
        match self {
            Self::Loading { poll_id }
            | Self::Loaded { poll_id }
            | Self::Updated { poll_id }
            | Self::Failed { poll_id, .. } => poll_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Loading { .. } => "loading",
            Self::Loaded { .. } => "loaded",
            Self::Updated { .. } => "updated",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Events broadcast on the in-flight batch channel. Exactly one terminal
/// event closes a batch that ran to its end; an abandoned batch (service
/// dropped mid-walk) closes the channel without one.
#[derive(Clone, Debug)]
pub enum BatchEvent {
    Poll(TimelinePollDetails),
    Completed,
    Failed(PaginationError),
}

impl BatchEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }
}

pin_project! {
    /// Stream of historical poll discoveries for one batch: zero or more
    /// `Ok(details)`, then either a clean end (batch completed) or a single
    /// `Err` (page fetch failed). Ends quietly if the batch is abandoned.
    pub struct BatchStream {
        #[pin]
        inner: BroadcastStream<BatchEvent>,
        terminated: bool,
    }
}

impl BatchStream {
    pub fn new(rx: broadcast::Receiver<BatchEvent>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
            terminated: false,
        }
    }
}

impl Stream for BatchStream {
    type Item = Result<TimelinePollDetails, PaginationError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.terminated {
            return Poll::Ready(None);
        }
        loop {
            match futures::ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(BatchEvent::Poll(details))) => return Poll::Ready(Some(Ok(details))),
                Some(Ok(BatchEvent::Completed)) => {
                    *this.terminated = true;
                    return Poll::Ready(None);
                }
                Some(Ok(BatchEvent::Failed(error))) => {
                    *this.terminated = true;
                    return Poll::Ready(Some(Err(error)));
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, "batch subscriber lagged, discoveries dropped");
                }
                None => {
                    *this.terminated = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}

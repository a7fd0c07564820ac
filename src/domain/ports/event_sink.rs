//! Event sink port for progress subscribers.
//!
//! A sink is the bus-facing half of a subscriber. Sends must never
//! block the bus: a full buffer is reported, not waited on, and the
//! back-pressure policy (slow marking, disconnect) lives in the bus.

use crate::domain::models::event::ProgressEvent;

/// Result of a non-blocking send into a subscriber's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSendResult {
    /// Event accepted into the buffer
    Accepted,
    /// Buffer full; event dropped for this subscriber
    Full,
    /// The far side is gone; subscriber should be removed
    Closed,
}

/// Bus-facing delivery surface of one subscriber.
pub trait EventSink: Send + Sync {
    /// Offer an event without blocking.
    fn try_send(&self, event: ProgressEvent) -> SinkSendResult;
}

/// Sink wrapping a bounded tokio channel; the standard implementation
/// for every transport.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::Sender<ProgressEvent>,
}

impl ChannelSink {
    /// Create a sink and its receiving half with the given capacity.
    pub fn bounded(capacity: usize) -> (Self, tokio::sync::mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn try_send(&self, event: ProgressEvent) -> SinkSendResult {
        use tokio::sync::mpsc::error::TrySendError;
        match self.tx.try_send(event) {
            Ok(()) => SinkSendResult::Accepted,
            Err(TrySendError::Full(_)) => SinkSendResult::Full,
            Err(TrySendError::Closed(_)) => SinkSendResult::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_reports_full_and_closed() {
        let (sink, mut rx) = ChannelSink::bounded(1);
        assert_eq!(
            sink.try_send(ProgressEvent::heartbeat()),
            SinkSendResult::Accepted
        );
        assert_eq!(
            sink.try_send(ProgressEvent::heartbeat()),
            SinkSendResult::Full
        );

        rx.recv().await.unwrap();
        assert_eq!(
            sink.try_send(ProgressEvent::heartbeat()),
            SinkSendResult::Accepted
        );

        rx.close();
        // Drain the buffered event, then the channel reports closed.
        rx.recv().await.unwrap();
        assert_eq!(
            sink.try_send(ProgressEvent::heartbeat()),
            SinkSendResult::Closed
        );
    }
}

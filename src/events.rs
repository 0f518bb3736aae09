//! A single typed event stream. Consumers subscribe; the core never
//! mutates state from inside a handler, it only ever pushes outward.

use std::time::Duration;

use futures_util::Stream;
use tokio::sync::broadcast;

use crate::classifier::{Category, Severity};
use crate::types::{ChunkIndex, TransferId};

#[derive(Debug, Clone)]
pub enum TransferEvent {
    TransferQueued { transfer_id: TransferId },
    TransferStarted { transfer_id: TransferId },
    ChunkTransferred {
        transfer_id: TransferId,
        chunk_index: ChunkIndex,
        success: bool,
        duration: Duration,
    },
    TransferProgress {
        transfer_id: TransferId,
        bytes_transferred: u64,
        total_bytes: u64,
        current_speed: f64,
        eta_seconds: Option<f64>,
    },
    TransferCompleted {
        transfer_id: TransferId,
        outcome: CompletionOutcome,
    },
    BandwidthThrottled { transfer_id: TransferId, delay: Duration },
    QosAdjusted { transfer_id: TransferId },
    NetworkCongestionDetected,
    ConnectionEstablished { connection_id: uuid::Uuid },
    ConnectionLost { connection_id: uuid::Uuid, reason: String },
    ConnectionTerminated { connection_id: uuid::Uuid, reason: String },
    HeartbeatReceived { connection_id: uuid::Uuid, sequence: u64 },
    ChunkCorruptionDetected { transfer_id: TransferId, chunk_index: ChunkIndex },
}

#[derive(Debug, Clone)]
pub enum CompletionOutcome {
    Success,
    Failed { category: Category, severity: Severity, last_cause: String },
    Cancelled { reason: String },
}

/// A fan-out broadcast sink. A lagging subscriber observes a gap
/// (`RecvError::Lagged`) instead of blocking the emitter.
#[derive(Clone)]
pub struct EventSink {
    tx: broadcast::Sender<TransferEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TransferEvent) {
        // No subscribers is not an error: events are fire-and-forget.
        let _ = self.tx.send(event);
    }

    /// Wraps a fresh subscription as a `Stream`, skipping over any `Lagged`
    /// gap rather than surfacing it as an error to the consumer.
    pub fn stream(&self) -> impl Stream<Item = TransferEvent> {
        let mut rx = self.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let sink = EventSink::default();
        let mut rx = sink.subscribe();
        sink.emit(TransferEvent::TransferQueued {
            transfer_id: uuid::Uuid::new_v4(),
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, TransferEvent::TransferQueued { .. }));
    }

    #[tokio::test]
    async fn emitting_with_no_subscribers_does_not_panic() {
        let sink = EventSink::default();
        sink.emit(TransferEvent::NetworkCongestionDetected);
    }

    #[tokio::test]
    async fn stream_yields_emitted_events_in_order() {
        use futures_util::StreamExt;

        let sink = EventSink::default();
        let mut stream = Box::pin(sink.stream());
        sink.emit(TransferEvent::TransferQueued {
            transfer_id: uuid::Uuid::new_v4(),
        });
        sink.emit(TransferEvent::NetworkCongestionDetected);

        assert!(matches!(stream.next().await, Some(TransferEvent::TransferQueued { .. })));
        assert!(matches!(stream.next().await, Some(TransferEvent::NetworkCongestionDetected)));
    }
}

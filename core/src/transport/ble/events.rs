/// Session events published to the application layer
///
/// Sessions only need a publish capability (`EventSink`). `EventBus` is the stock
/// implementation: an unbounded tokio channel whose receiver the UI or service layer
/// drains.

use tokio::sync::mpsc;
use tracing::debug;

use super::connection::ConnectionState;
use super::error::TransferFailure;
use super::gatt::ServiceDescriptor;
use super::transfer::{TransferId, TransferOutcome};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    /// Snapshot of the freshly discovered service catalog
    ServiceListChanged(Vec<ServiceDescriptor>),
    /// One inbound radio packet, exactly as received
    DataAvailable(Vec<u8>),
    /// A fragment was accepted by the transport
    FragmentSent {
        transfer: TransferId,
        len: usize,
    },
    TransferComplete {
        transfer: TransferId,
        bytes_sent: usize,
    },
    TransferFailed {
        transfer: TransferId,
        reason: TransferFailure,
    },
}

impl From<TransferOutcome> for SessionEvent {
    fn from(outcome: TransferOutcome) -> Self {
        match outcome {
            TransferOutcome::Complete { transfer, bytes_sent } => {
                SessionEvent::TransferComplete { transfer, bytes_sent }
            }
            TransferOutcome::Failed { transfer, reason, .. } => {
                SessionEvent::TransferFailed { transfer, reason }
            }
        }
    }
}

/// Publish capability handed to a session
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SessionEvent);
}

/// Channel-backed event sink
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventBus {
    /// Create a bus and the receiver its events arrive on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session event dropped: receiver closed");
        }
    }
}

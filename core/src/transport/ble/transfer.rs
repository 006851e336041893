/// Outbound transfer engine
///
/// Splits a payload into MTU-sized fragments and releases them one at a time: a new
/// fragment is only produced once the previous one has been acknowledged. Chunk sizes
/// are computed from the MTU passed in with each step, so a renegotiated MTU applies to
/// every fragment after it arrives. Nothing here touches the transport; the owning
/// session issues the writes and feeds acknowledgements back.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

use super::error::{SessionError, TransferFailure};
use super::gatt::{GattStatus, ATT_OVERHEAD_BYTES};

/// Identifier of one outbound transfer within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One slice of a payload, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub transfer: TransferId,
    /// Position of this fragment in emission order (0-based)
    pub index: usize,
    /// Offset of `data` within the payload
    pub offset: usize,
    pub data: Vec<u8>,
}

/// How a transfer ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Complete {
        transfer: TransferId,
        bytes_sent: usize,
    },
    Failed {
        transfer: TransferId,
        reason: TransferFailure,
        /// Bytes acknowledged before the failure
        bytes_sent: usize,
    },
}

/// Result of feeding an acknowledgement to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferProgress {
    /// Write this fragment next
    Next(Fragment),
    /// The transfer is over
    Finished(TransferOutcome),
    /// Nothing was pending; the acknowledgement was ignored
    Idle,
}

struct ActiveTransfer {
    id: TransferId,
    payload: Vec<u8>,
    /// Bytes acknowledged so far
    offset: usize,
    /// Byte range written but not yet acknowledged
    pending: Option<Range<usize>>,
    fragments_issued: usize,
}

impl ActiveTransfer {
    fn next_fragment(&mut self, chunk_size: usize) -> Fragment {
        let start = self.offset;
        let end = (start + chunk_size).min(self.payload.len());
        self.pending = Some(start..end);

        let fragment = Fragment {
            transfer: self.id,
            index: self.fragments_issued,
            offset: start,
            data: self.payload[start..end].to_vec(),
        };
        self.fragments_issued += 1;
        fragment
    }
}

/// Single-writer fragmenter for one session
pub struct TransferEngine {
    overhead_bytes: usize,
    next_id: u64,
    active: Option<ActiveTransfer>,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(ATT_OVERHEAD_BYTES)
    }
}

impl TransferEngine {
    pub fn new(overhead_bytes: usize) -> Self {
        Self {
            overhead_bytes,
            next_id: 1,
            active: None,
        }
    }

    /// Payload bytes per fragment at the given MTU (never below 1)
    pub fn chunk_size(&self, mtu: u16) -> usize {
        (mtu as usize).saturating_sub(self.overhead_bytes).max(1)
    }

    /// Number of fragments a payload needs at a fixed chunk size
    pub fn fragment_count(payload_len: usize, chunk_size: usize) -> usize {
        let chunk_size = chunk_size.max(1);
        (payload_len + chunk_size - 1) / chunk_size
    }

    pub fn is_busy(&self) -> bool {
        self.active.is_some()
    }

    /// Byte range of the fragment awaiting acknowledgement
    pub fn pending(&self) -> Option<Range<usize>> {
        self.active.as_ref().and_then(|active| active.pending.clone())
    }

    /// Start a transfer and return its first fragment
    pub fn begin(&mut self, payload: Vec<u8>, mtu: u16) -> Result<Fragment, SessionError> {
        if self.active.is_some() {
            return Err(SessionError::Busy);
        }
        if payload.is_empty() {
            return Err(SessionError::Configuration(
                "Payload is empty".to_string(),
            ));
        }

        let id = TransferId(self.next_id);
        self.next_id += 1;

        let chunk_size = self.chunk_size(mtu);
        let active = self.active.insert(ActiveTransfer {
            id,
            payload,
            offset: 0,
            pending: None,
            fragments_issued: 0,
        });
        Ok(active.next_fragment(chunk_size))
    }

    /// Feed the completion of the pending fragment
    ///
    /// `mtu` is the session's current MTU and sizes the next fragment. `connected`
    /// is the session's link state at the time of the acknowledgement.
    pub fn acknowledge(&mut self, status: GattStatus, mtu: u16, connected: bool) -> TransferProgress {
        let chunk_size = self.chunk_size(mtu);
        let Some(active) = self.active.as_mut() else {
            return TransferProgress::Idle;
        };
        let Some(written) = active.pending.take() else {
            return TransferProgress::Idle;
        };

        if !status.is_success() {
            return self.fail(TransferFailure::WriteFailed(status));
        }

        active.offset = written.end;
        if active.offset >= active.payload.len() {
            let outcome = TransferOutcome::Complete {
                transfer: active.id,
                bytes_sent: active.payload.len(),
            };
            self.active = None;
            return TransferProgress::Finished(outcome);
        }

        if !connected {
            return self.fail(TransferFailure::ConnectionLost);
        }

        TransferProgress::Next(active.next_fragment(chunk_size))
    }

    /// Drop the running transfer, if any
    pub fn abort(&mut self, reason: TransferFailure) -> Option<TransferOutcome> {
        match self.fail(reason) {
            TransferProgress::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }

    fn fail(&mut self, reason: TransferFailure) -> TransferProgress {
        match self.active.take() {
            Some(active) => TransferProgress::Finished(TransferOutcome::Failed {
                transfer: active.id,
                reason,
                bytes_sent: active.offset,
            }),
            None => TransferProgress::Idle,
        }
    }
}

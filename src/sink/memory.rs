use super::{FailurePolicy, SinkError, TransmissionSink};

use perfcollect_proto::{decode_blobs, Blob, DataHeader};
use std::sync::{Arc, Mutex};

/// Decoded blobs received by a [`MemorySink`], shared with whoever wants to
/// look at them.
#[derive(Clone, Default)]
pub struct BlobLog(Arc<Mutex<Vec<Blob>>>);

impl BlobLog {
    pub fn blobs(&self) -> Vec<Blob> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn extend(&self, blobs: Vec<Blob>) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(blobs);
    }
}

/// Keeps blobs in memory, decoded. Useful for testing and self checks.
pub struct MemorySink {
    log: BlobLog,
    failing: bool,
}

impl MemorySink {
    pub fn new() -> (Self, BlobLog) {
        let log = BlobLog::default();
        (
            MemorySink {
                log: log.clone(),
                failing: false,
            },
            log,
        )
    }

    /// A sink whose every send fails.
    pub fn failing() -> Self {
        MemorySink {
            log: BlobLog::default(),
            failing: true,
        }
    }
}

impl TransmissionSink for MemorySink {
    fn send(&mut self, _header: &DataHeader, blob: &[u8]) -> Result<(), SinkError> {
        if self.failing {
            return Err(SinkError::Rejected("sink configured to fail".into()));
        }
        let blobs = decode_blobs(blob).map_err(|e| SinkError::Rejected(e.to_string()))?;
        self.log.extend(blobs);
        Ok(())
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }
}

/// Discards the blobs, useful for dry runs.
#[derive(Default)]
pub struct NullSink {
    pub blobs: u64,
    pub bytes: u64,
}

impl TransmissionSink for NullSink {
    fn send(&mut self, _header: &DataHeader, blob: &[u8]) -> Result<(), SinkError> {
        self.blobs += 1;
        self.bytes += blob.len() as u64;
        Ok(())
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }
}

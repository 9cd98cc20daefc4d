//! Fixed-capacity per-thread sample buffers.
//!
//! Buffers allocate all of their storage up front. `admit` and `reset` never
//! allocate, lock, or perform I/O, so they can run inside a signal handler
//! that interrupted the owning thread.

mod pc;
mod stack;
mod trace;

pub use pc::{
    CounterDeltas, HwcBuffer, HwcSampView, PcBuffer, PcObservation, PcSampView, SampleWeight,
    MAX_COUNTERS,
};
pub use stack::{StackSample, StackSampleBuffer, UsertimeView};
pub use trace::{TraceBuffer, TraceObservation, TraceRecord, TraceView};

use crate::header::AddressRange;
use perfcollect_proto::BlobPayload;

/// Result of offering an observation to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Recorded, room is left.
    Stored,
    /// Recorded, and the buffer just reached its capacity.
    Filled,
    /// Not recorded. The buffer has to be flushed and reset first; an empty
    /// buffer always admits.
    NoRoom,
}

pub trait SampleBuffer {
    type Observation;
    type Payload<'a>: BlobPayload
    where
        Self: 'a;

    fn admit(&mut self, observation: &Self::Observation) -> Admission;

    /// Borrowed view of the buffered records, encoded straight from the
    /// buffer's storage at flush time.
    fn payload(&self) -> Self::Payload<'_>;

    /// Addresses covered by the records since the last reset.
    fn address_range(&self) -> AddressRange;

    /// Records held. Never exceeds [`SampleBuffer::capacity`].
    fn len(&self) -> usize;

    fn capacity(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upper bound of the encoded payload of a full buffer, used to size the
    /// flush scratch space once at start.
    fn max_encoded_len(&self) -> usize;

    fn reset(&mut self);
}

/// Longest varint encoding of a u64.
pub(crate) const MAX_VARINT_LEN: usize = 10;

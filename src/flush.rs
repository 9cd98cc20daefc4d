//! Turning a buffer into a blob.

use crate::buffer::SampleBuffer;
use crate::header::{DataHeader, DataHeaderExt};
use crate::sink::{FailurePolicy, TransmissionSink};
use crate::util::now;

use perfcollect_proto::{encode_blob, BlobPayload, FRAMING_OVERHEAD};
use tracing::{debug, error};

/// Where the next epoch starts after a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EpochStart {
    /// When the buffer was reset, after the send returned.
    #[default]
    Now,
    /// At the previous epoch's end, so consecutive blobs cover time without
    /// gaps.
    Contiguous,
}

/// When an admission outcome makes the collector flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushTrigger {
    /// Only when an observation does not fit. A full buffer keeps absorbing
    /// repeats of what it already holds.
    #[default]
    Overflow,
    /// As soon as the buffer reaches its capacity.
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub blobs: u64,
    pub bytes: u64,
    pub failed: u64,
}

/// Encodes buffers into a scratch area reserved up front and hands them to
/// the sink.
pub struct Emitter<S> {
    sink: S,
    scratch: Vec<u8>,
    epoch_start: EpochStart,
    stats: FlushStats,
}

impl<S: TransmissionSink> Emitter<S> {
    pub fn new(sink: S, epoch_start: EpochStart, scratch_capacity: usize) -> Self {
        Emitter {
            sink,
            scratch: Vec::with_capacity(scratch_capacity),
            epoch_start,
            stats: FlushStats::default(),
        }
    }

    /// Emitter whose scratch area holds any blob of `buffer` stamped with
    /// `header`, so flushing never allocates.
    pub fn sized_for<B: SampleBuffer>(
        sink: S,
        epoch_start: EpochStart,
        header: &DataHeader,
        buffer: &B,
    ) -> Self {
        let capacity = buffer.max_encoded_len() + header.max_encoded_len() + FRAMING_OVERHEAD;
        Self::new(sink, epoch_start, capacity)
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn replace_sink(&mut self, sink: S) -> S {
        std::mem::replace(&mut self.sink, sink)
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// Stamps the header with the buffer's extrema, sends the blob, then
    /// resets the buffer and opens the next epoch. Empty buffers are not
    /// sent.
    pub fn flush<B: SampleBuffer>(&mut self, header: &mut DataHeader, buffer: &mut B) {
        if buffer.is_empty() {
            return;
        }

        let time_end = now();
        header.stamp(buffer.address_range(), time_end);
        self.transmit(header, &buffer.payload());

        buffer.reset();
        let time_begin = match self.epoch_start {
            EpochStart::Now => now(),
            EpochStart::Contiguous => time_end,
        };
        header.begin_epoch(time_begin);
    }

    /// Sends a payload that is not kept in a sample buffer, stamped with
    /// `header` as is. The scratch area grows if the payload needs it.
    pub fn send_payload(&mut self, header: &DataHeader, payload: &impl BlobPayload) {
        self.transmit(header, payload);
    }

    fn transmit(&mut self, header: &DataHeader, payload: &impl BlobPayload) {
        self.scratch.clear();
        encode_blob(header, payload, &mut self.scratch);

        match self.sink.send(header, &self.scratch) {
            Ok(()) => {
                self.stats.blobs += 1;
                self.stats.bytes += self.scratch.len() as u64;
            }
            Err(err) => match self.sink.failure_policy() {
                FailurePolicy::Abort => {
                    error!("could not send {} data: {}", header.collector, err);
                    std::process::abort();
                }
                FailurePolicy::BestEffort => {
                    debug!("dropping {} blob: {}", header.collector, err);
                    self.stats.failed += 1;
                }
            },
        }
    }
}

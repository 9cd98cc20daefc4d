use super::{Admission, SampleBuffer, MAX_VARINT_LEN};
use crate::header::AddressRange;
use crate::stacks::{CallStack, CountedStackTable, Recorded};

use perfcollect_proto::framing::{encode_packed, packed_len};
use perfcollect_proto::{BlobPayload, PayloadKind};
use prost::bytes::BufMut;
use prost::encoding::uint64;

/// One sampled call stack and the time it stands for.
#[derive(Debug, Clone, Copy)]
pub struct StackSample {
    pub stack: CallStack,
    pub weight: u64,
}

/// Call stack samples kept in a [`CountedStackTable`].
pub struct StackSampleBuffer {
    interval: u64,
    table: CountedStackTable,
    range: AddressRange,
}

impl StackSampleBuffer {
    pub fn new(capacity: usize, interval: u64) -> Self {
        StackSampleBuffer {
            interval,
            table: CountedStackTable::with_capacity(capacity),
            range: AddressRange::EMPTY,
        }
    }

    /// Sampling interval in nanoseconds.
    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn table(&self) -> &CountedStackTable {
        &self.table
    }
}

pub struct UsertimeView<'a> {
    pub interval: u64,
    pub stacktraces: &'a [u64],
    pub counts: &'a [u8],
    pub weights: &'a [u64],
}

impl BlobPayload for UsertimeView<'_> {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Usertime
    }

    fn encoded_len(&self) -> usize {
        uint64::encoded_len(1, &self.interval)
            + packed_len(2, self.stacktraces.iter().copied())
            + packed_len(3, self.counts.iter().map(|count| *count as u64))
            + packed_len(4, self.weights.iter().copied())
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        uint64::encode(1, &self.interval, buf);
        encode_packed(2, self.stacktraces.iter().copied(), buf);
        encode_packed(3, self.counts.iter().map(|count| *count as u64), buf);
        encode_packed(4, self.weights.iter().copied(), buf);
    }
}

impl SampleBuffer for StackSampleBuffer {
    type Observation = StackSample;
    type Payload<'a> = UsertimeView<'a>;

    fn admit(&mut self, sample: &StackSample) -> Admission {
        match self
            .table
            .record_or_increment(sample.stack.as_slice(), sample.weight)
        {
            Ok(Recorded::Appended(offset)) => {
                self.range.widen_all(&self.table.frames()[offset..]);
                if self.table.len() == self.table.capacity() {
                    Admission::Filled
                } else {
                    Admission::Stored
                }
            }
            Ok(Recorded::Incremented(_)) | Ok(Recorded::Empty) => Admission::Stored,
            Err(_) => Admission::NoRoom,
        }
    }

    fn payload(&self) -> UsertimeView<'_> {
        UsertimeView {
            interval: self.interval,
            stacktraces: self.table.frames(),
            counts: self.table.counts(),
            weights: self.table.weights(),
        }
    }

    fn address_range(&self) -> AddressRange {
        self.range
    }

    fn len(&self) -> usize {
        self.table.len()
    }

    fn capacity(&self) -> usize {
        self.table.capacity()
    }

    fn max_encoded_len(&self) -> usize {
        4 * 2 * MAX_VARINT_LEN + 3 * self.capacity() * MAX_VARINT_LEN
    }

    fn reset(&mut self) {
        self.table.reset();
        self.range.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfcollect_proto::{decode_blobs, encode_blob, DataHeader, Payload, UsertimeData};

    fn sample(frames: &[u64], weight: u64) -> StackSample {
        StackSample {
            stack: CallStack::from_frames(frames),
            weight,
        }
    }

    #[test]
    fn test_stack_samples() {
        // Given
        let mut buffer = StackSampleBuffer::new(5, 1000);

        // When
        assert_eq!(buffer.admit(&sample(&[0x30, 0x20, 0x10], 1000)), Admission::Stored);
        assert_eq!(buffer.admit(&sample(&[0x30, 0x20, 0x10], 1000)), Admission::Stored);
        assert_eq!(buffer.admit(&sample(&[0x40, 0x10], 1000)), Admission::Filled);
        assert_eq!(buffer.admit(&sample(&[0x50], 1000)), Admission::NoRoom);

        // Then
        assert_eq!(buffer.len(), 5);
        assert_eq!(
            buffer.address_range(),
            AddressRange {
                begin: 0x10,
                end: 0x41
            }
        );

        let mut bytes = Vec::new();
        encode_blob(&DataHeader::default(), &buffer.payload(), &mut bytes);
        let blobs = decode_blobs(&bytes).unwrap();
        assert_eq!(
            blobs[0].payload,
            Some(Payload::Usertime(UsertimeData {
                interval: 1000,
                stacktraces: vec![0x30, 0x20, 0x10, 0x40, 0x10],
                count: vec![2, 0, 0, 1, 0],
                weight: vec![2000, 0, 0, 1000, 0],
            }))
        );

        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.address_range(), AddressRange::EMPTY);
    }
}

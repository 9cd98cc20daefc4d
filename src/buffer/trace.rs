use super::{Admission, SampleBuffer, MAX_VARINT_LEN};
use crate::header::AddressRange;
use crate::stacks::{CallStack, StackTraceTable};

use perfcollect_proto::framing::{encode_packed, packed_len};
use perfcollect_proto::{BlobPayload, IoEvent, MemEvent, MpiEvent, PayloadKind, PthreadsEvent};
use prost::bytes::BufMut;
use prost::encoding::message;

/// Event records of the traced-call collectors.
pub trait TraceRecord: prost::Message + Clone + Default + 'static {
    const KIND: PayloadKind;
    /// Scalar fields of the record.
    const FIELDS: usize;

    fn set_stacktrace(&mut self, offset: u32);
    fn set_times(&mut self, start_time: u64, stop_time: u64);
}

macro_rules! trace_record {
    ($event:ty, $kind:ident, $fields:literal) => {
        impl TraceRecord for $event {
            const KIND: PayloadKind = PayloadKind::$kind;
            const FIELDS: usize = $fields;

            fn set_stacktrace(&mut self, offset: u32) {
                self.stacktrace = offset;
            }

            fn set_times(&mut self, start_time: u64, stop_time: u64) {
                self.start_time = start_time;
                self.stop_time = stop_time;
            }
        }
    };
}

trace_record!(IoEvent, Io, 6);
trace_record!(MemEvent, Mem, 8);
trace_record!(MpiEvent, Mpi, 11);
trace_record!(PthreadsEvent, Pthreads, 8);

#[derive(Debug, Clone)]
pub struct TraceObservation<E> {
    pub event: E,
    pub stack: CallStack,
}

/// Traced events, each pointing at its call stack in a shared
/// [`StackTraceTable`].
pub struct TraceBuffer<E: TraceRecord> {
    events: Box<[E]>,
    len: usize,
    table: StackTraceTable,
    range: AddressRange,
}

impl<E: TraceRecord> TraceBuffer<E> {
    pub fn new(events: usize, stack_slots: usize) -> Self {
        TraceBuffer {
            events: vec![E::default(); events.max(1)].into_boxed_slice(),
            len: 0,
            table: StackTraceTable::with_capacity(stack_slots),
            range: AddressRange::EMPTY,
        }
    }

    pub fn events(&self) -> &[E] {
        &self.events[..self.len]
    }

    pub fn table(&self) -> &StackTraceTable {
        &self.table
    }
}

pub struct TraceView<'a, E> {
    pub stacktraces: &'a [u64],
    pub events: &'a [E],
}

impl<E: TraceRecord> BlobPayload for TraceView<'_, E> {
    fn kind(&self) -> PayloadKind {
        E::KIND
    }

    fn encoded_len(&self) -> usize {
        packed_len(1, self.stacktraces.iter().copied())
            + message::encoded_len_repeated(2, self.events)
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        encode_packed(1, self.stacktraces.iter().copied(), buf);
        for event in self.events {
            message::encode(2, event, buf);
        }
    }
}

impl<E: TraceRecord> SampleBuffer for TraceBuffer<E> {
    type Observation = TraceObservation<E>;
    type Payload<'a> = TraceView<'a, E> where Self: 'a;

    /// Interns the stack and appends the event. Nothing is recorded unless
    /// both the event and a new stack fit.
    fn admit(&mut self, observation: &TraceObservation<E>) -> Admission {
        if self.len == self.events.len() {
            return Admission::NoRoom;
        }
        let frames = observation.stack.as_slice();
        let offset = match self.table.intern_if_new(frames) {
            Ok(offset) => offset,
            Err(_) => return Admission::NoRoom,
        };
        let stored = self.table.as_slice()[offset..]
            .iter()
            .take_while(|frame| **frame != 0);
        for frame in stored {
            self.range.widen(*frame);
        }

        let event = &mut self.events[self.len];
        event.clone_from(&observation.event);
        event.set_stacktrace(offset as u32);
        self.len += 1;

        if self.len == self.events.len() {
            Admission::Filled
        } else {
            Admission::Stored
        }
    }

    fn payload(&self) -> TraceView<'_, E> {
        TraceView {
            stacktraces: self.table.as_slice(),
            events: self.events(),
        }
    }

    fn address_range(&self) -> AddressRange {
        self.range
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.events.len()
    }

    fn max_encoded_len(&self) -> usize {
        let event = E::FIELDS * (1 + MAX_VARINT_LEN);
        2 * MAX_VARINT_LEN
            + self.table.capacity() * MAX_VARINT_LEN
            + self.capacity() * (event + 2 * MAX_VARINT_LEN)
    }

    fn reset(&mut self) {
        self.len = 0;
        self.table.reset();
        self.range.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfcollect_proto::{decode_blobs, encode_blob, DataHeader, IoTraceData, Payload};

    const A: u64 = 0xa00;
    const B: u64 = 0xb00;
    const C: u64 = 0xc00;
    const D: u64 = 0xd00;

    fn observe(buffer: &mut TraceBuffer<IoEvent>, frames: &[u64], nbytes: u64) -> Admission {
        buffer.admit(&TraceObservation {
            event: IoEvent {
                call: 1,
                nbytes,
                ..Default::default()
            },
            stack: CallStack::from_frames(frames),
        })
    }

    #[test]
    fn test_events_share_stacks() {
        // Given
        let mut buffer = TraceBuffer::<IoEvent>::new(8, 10);

        // When
        observe(&mut buffer, &[A, B, C], 1);
        observe(&mut buffer, &[A, B, C], 2);
        observe(&mut buffer, &[A, D], 3);

        // Then
        let offsets: Vec<_> = buffer.events().iter().map(|e| e.stacktrace).collect();
        assert_eq!(offsets, vec![0, 0, 4]);
        assert_eq!(buffer.table().sequences(), 2);
        assert_eq!(buffer.table().len(), 7);
        assert_eq!(
            buffer.address_range(),
            AddressRange {
                begin: A,
                end: D + 1
            }
        );

        let mut bytes = Vec::new();
        encode_blob(&DataHeader::default(), &buffer.payload(), &mut bytes);
        assert!(bytes.len() < buffer.max_encoded_len());
        let blobs = decode_blobs(&bytes).unwrap();
        match &blobs[0].payload {
            Some(Payload::Io(IoTraceData {
                stacktraces,
                events,
            })) => {
                assert_eq!(stacktraces, &vec![A, B, C, 0, A, D, 0]);
                assert_eq!(events.len(), 3);
                assert_eq!(events[2].nbytes, 3);
                assert_eq!(events[2].stacktrace, 4);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_max_encoded_len_bounds_wide_records() {
        let mut buffer = TraceBuffer::<MpiEvent>::new(4, 64);
        let event = MpiEvent {
            start_time: u64::MAX,
            stop_time: u64::MAX,
            call: u32::MAX,
            source: -1,
            destination: -1,
            size: u64::MAX,
            tag: -1,
            communicator: -1,
            datatype: -1,
            retval: -1,
            ..Default::default()
        };
        for frame in [A, B, C, D] {
            buffer.admit(&TraceObservation {
                event: event.clone(),
                stack: CallStack::from_frames(&[u64::MAX - frame]),
            });
        }
        assert_eq!(buffer.len(), 4);

        let mut bytes = Vec::new();
        encode_blob(&DataHeader::default(), &buffer.payload(), &mut bytes);
        assert!(bytes.len() < buffer.max_encoded_len());
    }

    #[test]
    fn test_event_capacity() {
        let mut buffer = TraceBuffer::<IoEvent>::new(2, 64);
        assert_eq!(observe(&mut buffer, &[A], 1), Admission::Stored);
        assert_eq!(observe(&mut buffer, &[B], 1), Admission::Filled);
        assert_eq!(observe(&mut buffer, &[C], 1), Admission::NoRoom);
        // The rejected stack was not interned.
        assert_eq!(buffer.table().sequences(), 2);
    }

    #[test]
    fn test_stack_capacity() {
        let mut buffer = TraceBuffer::<IoEvent>::new(16, 6);
        assert_eq!(observe(&mut buffer, &[A, B, C], 1), Admission::Stored);
        assert_eq!(observe(&mut buffer, &[A, D], 1), Admission::NoRoom);
        assert_eq!(buffer.len(), 1);
        // Known stacks still fit.
        assert_eq!(observe(&mut buffer, &[A, B, C], 1), Admission::Stored);

        buffer.reset();
        assert_eq!(observe(&mut buffer, &[A, D], 1), Admission::Stored);
        assert_eq!(buffer.events()[0].stacktrace, 0);
    }
}

use super::{Admission, SampleBuffer, MAX_VARINT_LEN};
use crate::header::AddressRange;

use perfcollect_proto::framing::{encode_packed, packed_len};
use perfcollect_proto::{BlobPayload, PayloadKind};
use prost::bytes::BufMut;
use prost::encoding::{string, uint64};

/// Most hardware counters sampled at once.
pub const MAX_COUNTERS: usize = 6;

/// Extra per-address data accumulated alongside the hit count.
pub trait SampleWeight: Copy + Default {
    fn accumulate(&mut self, other: &Self);
}

impl SampleWeight for () {
    fn accumulate(&mut self, _other: &Self) {}
}

/// Counter deltas since the previous sample, one per configured event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDeltas(pub [u64; MAX_COUNTERS]);

impl SampleWeight for CounterDeltas {
    fn accumulate(&mut self, other: &Self) {
        for (value, delta) in self.0.iter_mut().zip(other.0.iter()) {
            *value = value.wrapping_add(*delta);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PcObservation<W = ()> {
    pub pc: u64,
    pub weight: W,
}

impl PcObservation<()> {
    pub fn new(pc: u64) -> Self {
        PcObservation { pc, weight: () }
    }
}

/// Flat program counter samples with per-address hit counts.
///
/// Addresses are located through an open-addressed table of
/// `capacity + capacity / 4` buckets holding `entry + 1` (zero marks a free
/// bucket). The bucket of an address is `(pc >> 4) % buckets`, with linear
/// probing on collision.
pub struct PcBuffer<W: SampleWeight = ()> {
    interval: u64,
    pcs: Box<[u64]>,
    counts: Box<[u64]>,
    weights: Box<[W]>,
    hash: Box<[u32]>,
    len: usize,
    range: AddressRange,
}

impl<W: SampleWeight> PcBuffer<W> {
    /// `interval` is the sampling period in nanoseconds, carried in every
    /// payload.
    pub fn new(capacity: usize, interval: u64) -> Self {
        let capacity = capacity.max(1);
        let buckets = capacity + (capacity / 4).max(1);
        PcBuffer {
            interval,
            pcs: vec![0; capacity].into_boxed_slice(),
            counts: vec![0; capacity].into_boxed_slice(),
            weights: vec![W::default(); capacity].into_boxed_slice(),
            hash: vec![0; buckets].into_boxed_slice(),
            len: 0,
            range: AddressRange::EMPTY,
        }
    }

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn pcs(&self) -> &[u64] {
        &self.pcs[..self.len]
    }

    pub fn counts(&self) -> &[u64] {
        &self.counts[..self.len]
    }

    pub fn weights(&self) -> &[W] {
        &self.weights[..self.len]
    }

    pub fn count_of(&self, pc: u64) -> Option<u64> {
        self.pcs()
            .iter()
            .position(|stored| *stored == pc)
            .map(|entry| self.counts[entry])
    }

    /// Counts one hit of `pc`.
    pub fn add(&mut self, pc: u64, weight: &W) -> Admission {
        let buckets = self.hash.len();
        let mut bucket = ((pc >> 4) % buckets as u64) as usize;

        for _ in 0..buckets {
            match self.hash[bucket] {
                0 => return self.insert(bucket, pc, weight),
                slot => {
                    let entry = slot as usize - 1;
                    if self.pcs[entry] == pc {
                        self.counts[entry] += 1;
                        self.weights[entry].accumulate(weight);
                        return Admission::Stored;
                    }
                }
            }
            bucket = (bucket + 1) % buckets;
        }
        // There are always more buckets than entries.
        Admission::NoRoom
    }

    fn insert(&mut self, bucket: usize, pc: u64, weight: &W) -> Admission {
        if self.len == self.pcs.len() {
            return Admission::NoRoom;
        }
        let entry = self.len;
        self.pcs[entry] = pc;
        self.counts[entry] = 1;
        self.weights[entry] = *weight;
        self.hash[bucket] = entry as u32 + 1;
        self.len += 1;
        self.range.widen(pc);

        if self.len == self.pcs.len() {
            Admission::Filled
        } else {
            Admission::Stored
        }
    }

    fn clear(&mut self) {
        self.hash.fill(0);
        self.len = 0;
        self.range.reset();
    }
}

/// Payload of the `pcsamp` collector.
pub struct PcSampView<'a> {
    pub interval: u64,
    pub pcs: &'a [u64],
    pub counts: &'a [u64],
}

impl BlobPayload for PcSampView<'_> {
    fn kind(&self) -> PayloadKind {
        PayloadKind::PcSamp
    }

    fn encoded_len(&self) -> usize {
        uint64::encoded_len(1, &self.interval)
            + packed_len(2, self.pcs.iter().copied())
            + packed_len(3, self.counts.iter().copied())
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        uint64::encode(1, &self.interval, buf);
        encode_packed(2, self.pcs.iter().copied(), buf);
        encode_packed(3, self.counts.iter().copied(), buf);
    }
}

impl SampleBuffer for PcBuffer<()> {
    type Observation = PcObservation<()>;
    type Payload<'a> = PcSampView<'a>;

    fn admit(&mut self, observation: &PcObservation<()>) -> Admission {
        self.add(observation.pc, &())
    }

    fn payload(&self) -> PcSampView<'_> {
        PcSampView {
            interval: self.interval,
            pcs: self.pcs(),
            counts: self.counts(),
        }
    }

    fn address_range(&self) -> AddressRange {
        self.range
    }

    fn len(&self) -> usize {
        self.len
    }

    fn capacity(&self) -> usize {
        self.pcs.len()
    }

    fn max_encoded_len(&self) -> usize {
        3 * 2 * MAX_VARINT_LEN + 2 * self.capacity() * MAX_VARINT_LEN
    }

    fn reset(&mut self) {
        self.clear();
    }
}

/// Payload of the `hwcsamp` collector. Only the first `events.len()` deltas
/// of each entry are written.
pub struct HwcSampView<'a> {
    pub interval: u64,
    pub events: &'a [String],
    pub pcs: &'a [u64],
    pub counts: &'a [u64],
    pub deltas: &'a [CounterDeltas],
}

impl HwcSampView<'_> {
    fn flattened(&self) -> impl Iterator<Item = u64> + Clone + '_ {
        let width = self.events.len().min(MAX_COUNTERS);
        self.deltas
            .iter()
            .flat_map(move |deltas| deltas.0[..width].iter().copied())
    }
}

impl BlobPayload for HwcSampView<'_> {
    fn kind(&self) -> PayloadKind {
        PayloadKind::HwcSamp
    }

    fn encoded_len(&self) -> usize {
        uint64::encoded_len(1, &self.interval)
            + packed_len(2, self.pcs.iter().copied())
            + packed_len(3, self.counts.iter().copied())
            + string::encoded_len_repeated(4, self.events)
            + packed_len(5, self.flattened())
    }

    fn encode_raw(&self, buf: &mut impl BufMut) {
        uint64::encode(1, &self.interval, buf);
        encode_packed(2, self.pcs.iter().copied(), buf);
        encode_packed(3, self.counts.iter().copied(), buf);
        string::encode_repeated(4, self.events, buf);
        encode_packed(5, self.flattened(), buf);
    }
}

impl PcBuffer<CounterDeltas> {
    pub fn hwc_payload<'a>(&'a self, events: &'a [String]) -> HwcSampView<'a> {
        HwcSampView {
            interval: self.interval,
            events,
            pcs: self.pcs(),
            counts: self.counts(),
            deltas: self.weights(),
        }
    }
}

/// [`PcBuffer`] with counter deltas and the names of the counters.
pub struct HwcBuffer {
    pub(crate) samples: PcBuffer<CounterDeltas>,
    pub(crate) events: Vec<String>,
}

impl HwcBuffer {
    pub fn new(capacity: usize, interval: u64, events: Vec<String>) -> Self {
        HwcBuffer {
            samples: PcBuffer::new(capacity, interval),
            events,
        }
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn samples(&self) -> &PcBuffer<CounterDeltas> {
        &self.samples
    }
}

impl SampleBuffer for HwcBuffer {
    type Observation = PcObservation<CounterDeltas>;
    type Payload<'a> = HwcSampView<'a>;

    fn admit(&mut self, observation: &PcObservation<CounterDeltas>) -> Admission {
        self.samples.add(observation.pc, &observation.weight)
    }

    fn payload(&self) -> HwcSampView<'_> {
        self.samples.hwc_payload(&self.events)
    }

    fn address_range(&self) -> AddressRange {
        self.samples.range
    }

    fn len(&self) -> usize {
        self.samples.len
    }

    fn capacity(&self) -> usize {
        self.samples.pcs.len()
    }

    fn max_encoded_len(&self) -> usize {
        let names: usize = self.events.iter().map(|name| name.len() + 2 * MAX_VARINT_LEN).sum();
        4 * 2 * MAX_VARINT_LEN + names + (2 + MAX_COUNTERS) * self.capacity() * MAX_VARINT_LEN
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

//! The per-thread collector shared by every collector kind, and the kinds
//! themselves.
//!
//! A [`ThreadCollector`] owns the buffer, the header and the sink of one
//! thread. It is kept in a thread local slot of its kind and reached from
//! the event source callbacks running on that same thread.

pub mod hwc;
pub mod hwcsamp;
pub mod hwctime;
pub mod io;
pub mod mem;
pub mod mpi;
pub mod pcsamp;
pub mod pthreads;
mod runtime;
mod slot;
mod trace;
pub mod usertime;

pub use runtime::{CollectorControl, CollectorKind, LocalCollector, Runtime};
pub use slot::{SlotKey, ThreadLocalStore};
pub use trace::{TraceKind, TracedCall};

use crate::buffer::{Admission, SampleBuffer};
use crate::dso::{self, LinkedObjectsView};
use crate::flush::{Emitter, EpochStart, FlushStats, FlushTrigger};
use crate::header::{DataHeader, DataHeaderExt};
use crate::lifecycle::CollectionStatus;
use crate::sink::{SinkError, TransmissionSink};
use crate::source::{EventSource, SourceError};
use crate::util::now;

use perfcollect_proto::LinkedObject;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("event source setup failed: {0}")]
    Source(#[from] SourceError),
    #[error("could not create the sink: {0}")]
    Sink(#[from] SinkError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Flush behaviour of one collector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorOptions {
    pub epoch_start: EpochStart,
    pub trigger: FlushTrigger,
    /// Flush whatever is buffered when pausing.
    pub flush_on_pause: bool,
}

pub struct ThreadCollector<B, S, E>
where
    B: SampleBuffer,
    S: TransmissionSink,
    E: EventSource,
{
    status: CollectionStatus,
    paused: bool,
    header: DataHeader,
    buffer: B,
    emitter: Emitter<S>,
    source: E,
    options: CollectorOptions,
    dropped: u64,
}

impl<B, S, E> ThreadCollector<B, S, E>
where
    B: SampleBuffer,
    S: TransmissionSink,
    E: EventSource,
{
    /// Starts collecting on the calling thread. The first thread to start
    /// with a given kind of source also sets that source up process-wide.
    pub fn start(
        mut header: DataHeader,
        buffer: B,
        sink: S,
        mut source: E,
        options: CollectorOptions,
    ) -> Result<Self, StartError> {
        header.begin_epoch(now());
        let emitter = Emitter::sized_for(sink, options.epoch_start, &header, &buffer);

        let registry = source.registry();
        registry.enter(|| source.setup_process())?;
        if let Err(err) = source.attach() {
            registry.exit(|| source.teardown_process());
            return Err(err.into());
        }
        debug!(
            "{} collection started on tid {}",
            header.collector, header.posix_tid
        );

        Ok(ThreadCollector {
            status: CollectionStatus::Started,
            paused: false,
            header,
            buffer,
            emitter,
            source,
            options,
            dropped: 0,
        })
    }

    /// Records one observation. Returns false when nothing was recorded, that
    /// is while paused or after stopping.
    pub fn observe(&mut self, observation: &B::Observation) -> bool {
        if self.paused || !self.status.is_active() {
            return false;
        }
        match self.buffer.admit(observation) {
            Admission::Stored => true,
            Admission::Filled => {
                if self.options.trigger == FlushTrigger::Full {
                    self.flush();
                }
                true
            }
            Admission::NoRoom => {
                self.flush();
                match self.buffer.admit(observation) {
                    Admission::NoRoom => {
                        self.dropped += 1;
                        false
                    }
                    Admission::Filled if self.options.trigger == FlushTrigger::Full => {
                        self.flush();
                        true
                    }
                    _ => true,
                }
            }
        }
    }

    /// Sends whatever is buffered.
    pub fn flush(&mut self) {
        self.emitter.flush(&mut self.header, &mut self.buffer);
    }

    /// Stops recording until [`ThreadCollector::resume`]. The pause flag is a
    /// plain boolean: pausing twice and resuming once resumes.
    pub fn pause(&mut self) {
        if !self.status.is_live() {
            return;
        }
        self.paused = true;
        self.status = CollectionStatus::Paused;
        self.source.suspend();
        if self.options.flush_on_pause {
            self.flush();
        }
    }

    pub fn resume(&mut self) {
        if !self.status.is_live() {
            return;
        }
        self.paused = false;
        self.status = CollectionStatus::Resumed;
        self.source.unsuspend();
    }

    /// Detaches the source, sends what is left and finishes. The last thread
    /// to stop tears the source down. Stopping twice is a no-op.
    pub fn stop(&mut self) -> FlushStats {
        if !self.status.is_live() {
            return self.emitter.stats();
        }
        self.paused = true;
        self.source.detach();
        let registry = self.source.registry();
        registry.exit(|| self.source.teardown_process());
        self.flush();
        self.status = CollectionStatus::Finished;
        debug!(
            "{} collection finished on tid {}: {:?}, {} dropped",
            self.header.collector,
            self.header.posix_tid,
            self.emitter.stats(),
            self.dropped
        );
        self.emitter.stats()
    }

    /// Sends the given linked objects in a blob of their own, stamped with
    /// the thread's identity and the addresses they span. Buffered samples
    /// are left for the next flush.
    pub fn send_linked_objects(&mut self, objects: &[LinkedObject]) {
        if objects.is_empty() || !self.status.is_live() {
            return;
        }
        let mut header = self.header.clone();
        let time = now();
        header.begin_epoch(time);
        header.stamp(dso::address_range(objects), time);
        self.emitter.send_payload(&header, &LinkedObjectsView(objects));
    }

    /// Sets the rank every following blob is stamped with, connecting the
    /// sink if it is addressed by rank.
    pub fn connect(&mut self, rank: i32) -> Result<(), SinkError> {
        self.header.rank = rank;
        let sink = self.emitter.sink_mut();
        if sink.needs_rank() && !sink.is_connected() {
            sink.connect(rank)?;
        }
        Ok(())
    }

    /// Whether the sink can not deliver anything until a rank is known.
    pub fn awaits_rank(&self) -> bool {
        let sink = self.emitter.sink();
        sink.needs_rank() && !sink.is_connected()
    }

    /// Continues collection in a forked child: the inherited records belong
    /// to the parent, and timers do not survive a fork.
    pub fn restart_in_child(&mut self, sink: S) -> Result<(), StartError> {
        self.buffer.reset();
        self.header.refresh_identity();
        self.header.begin_epoch(now());
        self.emitter.replace_sink(sink);
        self.source.registry().reset_in_child(self.status.is_live());
        if self.status.is_live() {
            self.source.detach();
            self.source.attach()?;
            if self.paused {
                self.source.suspend();
            }
        }
        Ok(())
    }

    pub fn status(&self) -> CollectionStatus {
        self.status
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn header(&self) -> &DataHeader {
        &self.header
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn source(&self) -> &E {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut E {
        &mut self.source
    }

    pub fn stats(&self) -> FlushStats {
        self.emitter.stats()
    }

    /// Observations lost because they did not fit even an empty buffer.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// A thread that exits without stopping still sends what it buffered.
impl<B, S, E> Drop for ThreadCollector<B, S, E>
where
    B: SampleBuffer,
    S: TransmissionSink,
    E: EventSource,
{
    fn drop(&mut self) {
        if self.status.is_live() {
            self.stop();
        }
    }
}

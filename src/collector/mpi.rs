//! Tracing of MPI calls.

use super::{CollectorKind, CollectorOptions, LocalCollector, Runtime, SlotKey, StartError};
use super::{TraceKind, TracedCall};
use crate::buffer::TraceBuffer;
use crate::config::CollectorConfig;
use crate::flush::{EpochStart, FlushTrigger};
use crate::source::{CallSource, TracedFunctions};
use crate::util::blob_size_factor;

use perfcollect_proto::MpiEvent;
use std::cell::{Cell, RefCell};
use std::thread::LocalKey;

pub const MPI_EVENT_SLOTS: usize = 415;
pub const MPI_STACK_SLOTS: usize = 384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MpiCall {
    Allgather,
    Allgatherv,
    Allreduce,
    Alltoall,
    Alltoallv,
    Barrier,
    Bcast,
    Bsend,
    Cancel,
    CommCreate,
    CommDup,
    CommFree,
    CommSplit,
    Finalize,
    Gather,
    Gatherv,
    Ibsend,
    Init,
    Iprobe,
    Irecv,
    Irsend,
    Isend,
    Issend,
    Probe,
    Recv,
    Reduce,
    ReduceScatter,
    Rsend,
    Scan,
    Scatter,
    Scatterv,
    Send,
    Sendrecv,
    SendrecvReplace,
    Ssend,
    Test,
    Testall,
    Testany,
    Wait,
    Waitall,
    Waitany,
}

pub const TRACEABLE: &[&str] = &[
    "MPI_Allgather",
    "MPI_Allgatherv",
    "MPI_Allreduce",
    "MPI_Alltoall",
    "MPI_Alltoallv",
    "MPI_Barrier",
    "MPI_Bcast",
    "MPI_Bsend",
    "MPI_Cancel",
    "MPI_Comm_create",
    "MPI_Comm_dup",
    "MPI_Comm_free",
    "MPI_Comm_split",
    "MPI_Finalize",
    "MPI_Gather",
    "MPI_Gatherv",
    "MPI_Ibsend",
    "MPI_Init",
    "MPI_Iprobe",
    "MPI_Irecv",
    "MPI_Irsend",
    "MPI_Isend",
    "MPI_Issend",
    "MPI_Probe",
    "MPI_Recv",
    "MPI_Reduce",
    "MPI_Reduce_scatter",
    "MPI_Rsend",
    "MPI_Scan",
    "MPI_Scatter",
    "MPI_Scatterv",
    "MPI_Send",
    "MPI_Sendrecv",
    "MPI_Sendrecv_replace",
    "MPI_Ssend",
    "MPI_Test",
    "MPI_Testall",
    "MPI_Testany",
    "MPI_Wait",
    "MPI_Waitall",
    "MPI_Waitany",
];

impl MpiCall {
    pub fn name(self) -> &'static str {
        TRACEABLE[self as usize]
    }
}

/// Message parameters of one MPI call. Calls without a peer or a message
/// leave the matching fields at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    pub source: i32,
    pub destination: i32,
    /// Bytes sent or received.
    pub size: u64,
    pub tag: i32,
    pub communicator: i64,
    pub datatype: i64,
    pub retval: i32,
}

pub struct Mpi;

thread_local! {
    static MPI: RefCell<Option<LocalCollector<Mpi>>> = const { RefCell::new(None) };
    static NESTING: Cell<u32> = const { Cell::new(0) };
}

impl CollectorKind for Mpi {
    const NAME: &'static str = "mpi";

    type Buffer = TraceBuffer<MpiEvent>;
    type Source = CallSource;

    fn slot() -> &'static SlotKey<LocalCollector<Self>> {
        &MPI
    }

    fn build(
        config: &CollectorConfig,
    ) -> Result<(TraceBuffer<MpiEvent>, CallSource, CollectorOptions), StartError> {
        let factor = blob_size_factor();
        let buffer = TraceBuffer::new(MPI_EVENT_SLOTS * factor, MPI_STACK_SLOTS * factor);
        let traced = TracedFunctions::parse(config.mpi_traced.as_deref(), TRACEABLE);
        let options = CollectorOptions {
            epoch_start: config.epoch_start_or(EpochStart::Now),
            trigger: FlushTrigger::Full,
            flush_on_pause: false,
        };
        Ok((buffer, CallSource::new(traced), options))
    }
}

impl TraceKind<MpiEvent> for Mpi {
    fn nesting() -> &'static LocalKey<Cell<u32>> {
        &NESTING
    }
}

pub fn start_event(call: MpiCall) -> Option<TracedCall> {
    <Mpi as TraceKind<MpiEvent>>::start_event(call.name())
}

fn event(call: MpiCall, transfer: Transfer) -> MpiEvent {
    MpiEvent {
        call: call as u32,
        source: transfer.source,
        destination: transfer.destination,
        size: transfer.size,
        tag: transfer.tag,
        communicator: transfer.communicator,
        datatype: transfer.datatype,
        retval: transfer.retval,
        ..Default::default()
    }
}

pub fn record_event(traced: TracedCall, call: MpiCall, transfer: Transfer, function: u64) -> bool {
    <Mpi as TraceKind<MpiEvent>>::record_event(traced, event(call, transfer), function)
}

pub fn runtime(config: CollectorConfig) -> Runtime<Mpi> {
    Runtime::from_config(config)
}

//! Rank-keyed network transport.
//!
//! The transport is addressed by MPI rank, which is unknown until MPI has
//! been initialized. Until some thread connects, blobs from every network
//! sink of the process are held in one pending queue. Connecting starts one
//! forwarder thread per process that POSTs the pending and all later blobs
//! to `<endpoint>/blobs/<rank>`. Delivery is best effort.
//!
//! Blob buffers come from a process-wide pool that the forwarder refills, so
//! a steady stream of flushes does not allocate. The first sends of a
//! process, before the pool has warmed up, do.

use super::{FailurePolicy, SinkError, TransmissionSink};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use perfcollect_proto::DataHeader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, span, warn, Level};

/// Blobs waiting for the forwarder, and blobs held until the process
/// connects. Senders never block on a full queue.
pub const QUEUE_DEPTH: usize = 256;
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

static CONNECTED: AtomicBool = AtomicBool::new(false);

lazy_static! {
    static ref STATE: Mutex<State> = Mutex::new(State::default());
    static ref POOL: BufferPool = BufferPool::new(QUEUE_DEPTH);
}

/// Recycled blob buffers.
struct BufferPool {
    free: Sender<Vec<u8>>,
    taken: Receiver<Vec<u8>>,
}

impl BufferPool {
    fn new(depth: usize) -> Self {
        let (free, taken) = bounded(depth);
        BufferPool { free, taken }
    }

    fn copy_of(&self, blob: &[u8]) -> Vec<u8> {
        let mut buffer = self.taken.try_recv().unwrap_or_default();
        buffer.clear();
        buffer.extend_from_slice(blob);
        buffer
    }

    fn recycle(&self, buffer: Vec<u8>) {
        let _ = self.free.try_send(buffer);
    }
}

struct State {
    transport: Option<Transport>,
    pending: Vec<Vec<u8>>,
}

impl Default for State {
    fn default() -> Self {
        State {
            transport: None,
            pending: Vec::with_capacity(QUEUE_DEPTH),
        }
    }
}

#[derive(Clone)]
struct Transport {
    rank: i32,
    sender: Sender<Vec<u8>>,
}

/// Queues `blob` for the forwarder, handing its buffer back to the pool when
/// the forwarder can not take it.
fn enqueue(sender: &Sender<Vec<u8>>, blob: Vec<u8>) -> Result<(), SinkError> {
    match sender.try_send(blob) {
        Ok(()) => Ok(()),
        Err(TrySendError::Full(blob)) => {
            recycle(blob);
            Err(SinkError::QueueFull)
        }
        Err(TrySendError::Disconnected(blob)) => {
            recycle(blob);
            Err(SinkError::NotConnected)
        }
    }
}

fn recycle(buffer: Vec<u8>) {
    POOL.recycle(buffer);
}

pub fn is_connected() -> bool {
    CONNECTED.load(Ordering::Acquire)
}

/// Rank the process connected with, if any.
pub fn connected_rank() -> Option<i32> {
    STATE
        .lock()
        .transport
        .as_ref()
        .map(|transport| transport.rank)
}

/// Blobs held until the process connects.
pub fn pending() -> usize {
    STATE.lock().pending.len()
}

/// Connects the process to `endpoint` as `rank` and hands everything held so
/// far to the forwarder. Only the first call does anything; later calls,
/// from any thread, are no-ops.
pub fn connect(endpoint: &str, rank: i32) -> Result<(), SinkError> {
    let mut state = STATE.lock();
    if state.transport.is_some() {
        return Ok(());
    }

    let (sender, receiver) = bounded(QUEUE_DEPTH);
    let url = format!("{}/blobs/{}", endpoint.trim_end_matches('/'), rank);
    std::thread::Builder::new()
        .name("perfcollect-forwarder".into())
        .spawn(move || forward(url, receiver))
        .map_err(SinkError::Forwarder)?;

    let held = state.pending.len();
    for blob in state.pending.drain(..) {
        if let Err(err) = enqueue(&sender, blob) {
            warn!("held blob dropped: {}", err);
        }
    }
    state.transport = Some(Transport { rank, sender });
    CONNECTED.store(true, Ordering::Release);
    debug!("connected to {} as rank {}, {} held blobs forwarded", endpoint, rank, held);
    Ok(())
}

/// Forgets the parent's connection and held blobs in a forked child, whose
/// forwarder thread did not survive the fork.
pub fn forget_after_fork() {
    let mut state = match STATE.try_lock() {
        Some(state) => state,
        None => {
            // The holder was a thread of the parent. It does not exist here.
            unsafe { STATE.force_unlock() };
            STATE.lock()
        }
    };
    state.transport = None;
    state.pending.clear();
    CONNECTED.store(false, Ordering::Release);
}

fn forward(url: String, receiver: Receiver<Vec<u8>>) {
    let client = match reqwest::blocking::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!("could not build http client, network data is dropped: {}", err);
            return;
        }
    };

    for blob in receiver {
        let _span = span!(Level::DEBUG, "forward blob").entered();
        let response = client.post(url.clone()).body(blob.clone()).send();
        debug!("http response: {:?}", response);
        recycle(blob);
    }
}

pub struct NetworkSink {
    endpoint: String,
    sender: Option<Sender<Vec<u8>>>,
    dropped: u64,
}

impl NetworkSink {
    pub fn new(endpoint: &str) -> Self {
        NetworkSink {
            endpoint: endpoint.to_string(),
            sender: None,
            dropped: 0,
        }
    }

    /// Blobs dropped because the pending queue or the forwarder queue was
    /// full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn sender(&mut self) -> Option<&Sender<Vec<u8>>> {
        if self.sender.is_none() && is_connected() {
            self.sender = STATE
                .lock()
                .transport
                .as_ref()
                .map(|transport| transport.sender.clone());
        }
        self.sender.as_ref()
    }
}

/// Holds `blob` until the process connects, or forwards it when another
/// thread connected in the meantime.
fn hold(blob: Vec<u8>) -> Result<(), SinkError> {
    let mut state = STATE.lock();
    if let Some(transport) = &state.transport {
        return enqueue(&transport.sender, blob);
    }
    if state.pending.len() >= QUEUE_DEPTH {
        recycle(blob);
        return Err(SinkError::QueueFull);
    }
    state.pending.push(blob);
    Ok(())
}

impl TransmissionSink for NetworkSink {
    fn send(&mut self, _header: &DataHeader, blob: &[u8]) -> Result<(), SinkError> {
        let blob = POOL.copy_of(blob);
        let result = match self.sender() {
            Some(sender) => enqueue(sender, blob),
            None => hold(blob),
        };
        if result.is_err() {
            self.dropped += 1;
        }
        result
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::BestEffort
    }

    fn needs_rank(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        is_connected()
    }

    fn connect(&mut self, rank: i32) -> Result<(), SinkError> {
        connect(&self.endpoint, rank)
    }
}

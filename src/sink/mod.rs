//! Destinations for flushed blobs.
//!
//! A sink receives one framed blob at a time together with the header it was
//! stamped with. Collectors are written against [`TransmissionSink`] only;
//! which backend they talk to is decided when the collector is started.

mod file;
mod memory;
pub mod network;

pub use file::FileSink;
pub use memory::{BlobLog, MemorySink, NullSink};
pub use network::NetworkSink;

use perfcollect_proto::DataHeader;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("not connected to the collection network")]
    NotConnected,
    #[error("network queue is full")]
    QueueFull,
    #[error("failed to start the network forwarder: {0}")]
    Forwarder(std::io::Error),
    #[error("blob rejected: {0}")]
    Rejected(String),
}

/// What a failed send means for the profiled process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Data would silently go missing; the process is aborted.
    Abort,
    /// The failure is logged and the blob dropped.
    BestEffort,
}

pub trait TransmissionSink {
    fn send(&mut self, header: &DataHeader, blob: &[u8]) -> Result<(), SinkError>;

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }

    /// Whether blobs are addressed by a rank that is only known once MPI is
    /// initialized.
    fn needs_rank(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn connect(&mut self, _rank: i32) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<T: TransmissionSink + ?Sized> TransmissionSink for Box<T> {
    fn send(&mut self, header: &DataHeader, blob: &[u8]) -> Result<(), SinkError> {
        (**self).send(header, blob)
    }

    fn failure_policy(&self) -> FailurePolicy {
        (**self).failure_policy()
    }

    fn needs_rank(&self) -> bool {
        (**self).needs_rank()
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn connect(&mut self, rank: i32) -> Result<(), SinkError> {
        (**self).connect(rank)
    }
}

pub type DynSink = Box<dyn TransmissionSink>;

/// Builds the sink of a newly started thread from its header.
pub type SinkFactory = Arc<dyn Fn(&DataHeader) -> Result<DynSink, SinkError> + Send + Sync>;

pub fn sink_factory<F>(make: F) -> SinkFactory
where
    F: Fn(&DataHeader) -> Result<DynSink, SinkError> + Send + Sync + 'static,
{
    Arc::new(make)
}

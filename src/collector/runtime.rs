use super::slot::{SlotKey, ThreadLocalStore};
use super::{CollectorOptions, StartError, ThreadCollector};
use crate::buffer::SampleBuffer;
use crate::config::CollectorConfig;
use crate::dso;
use crate::flush::FlushStats;
use crate::header::{DataHeader, DataHeaderExt};
use crate::lifecycle::CollectionStatus;
use crate::logging;
use crate::sink::{network, DynSink, SinkError, SinkFactory};
use crate::source::EventSource;

use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

/// One kind of collector: what it buffers, what feeds it, and where each
/// thread keeps its instance.
pub trait CollectorKind: Sized + 'static {
    /// Collector id written into every header.
    const NAME: &'static str;

    type Buffer: SampleBuffer + 'static;
    type Source: EventSource + 'static;

    fn slot() -> &'static SlotKey<LocalCollector<Self>>;

    /// Allocates the buffer and prepares the source of a starting thread.
    fn build(
        config: &CollectorConfig,
    ) -> Result<(Self::Buffer, Self::Source, CollectorOptions), StartError>;
}

pub type LocalCollector<K> =
    ThreadCollector<<K as CollectorKind>::Buffer, DynSink, <K as CollectorKind>::Source>;

/// Lifecycle operations on the calling thread's collector.
pub trait CollectorControl {
    fn start(&self) -> Result<(), StartError>;
    fn pause(&self);
    fn resume(&self);
    fn flush(&self);
    /// Finishes the thread's collector and releases it.
    fn stop(&self) -> Option<FlushStats>;
    /// `None` when the calling thread has no collector.
    fn status(&self) -> Option<CollectionStatus>;
    fn connect(&self, rank: i32) -> Result<(), SinkError>;
    /// Whether collection has to wait for a rank before data can be sent.
    fn awaits_rank(&self) -> bool;
    fn restart_in_child(&self) -> Result<(), StartError>;
    /// Sends the executable mappings of the process, or only the one of
    /// `library`, from the calling thread's collector.
    fn record_linked_objects(&self, library: Option<&str>);
}

/// Starts and drives collectors of kind `K` on whatever thread calls it.
pub struct Runtime<K> {
    config: Arc<CollectorConfig>,
    sinks: SinkFactory,
    kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Runtime<K> {
    fn clone(&self) -> Self {
        Runtime {
            config: self.config.clone(),
            sinks: self.sinks.clone(),
            kind: PhantomData,
        }
    }
}

impl<K: CollectorKind> Runtime<K> {
    pub fn new(config: CollectorConfig, sinks: SinkFactory) -> Self {
        Runtime {
            config: Arc::new(config),
            sinks,
            kind: PhantomData,
        }
    }

    /// Runtime sending to the sink the configuration selects.
    pub fn from_config(config: CollectorConfig) -> Self {
        let sinks = config.sink_factory();
        Self::new(config, sinks)
    }

    /// Runtime configured from the `CBTF_*` environment, with logging set up
    /// as the configuration asks.
    pub fn from_env() -> anyhow::Result<Self> {
        let config = CollectorConfig::from_env()?;
        logging::init(config.debug_collector);
        debug!("{} configured from the environment: {:?}", K::NAME, config);
        Ok(Self::from_config(config))
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Runs `f` on the calling thread's collector, if it has one.
    pub fn with_collector<R>(&self, f: impl FnOnce(&mut LocalCollector<K>) -> R) -> Option<R> {
        K::slot().with_installed(f)
    }
}

impl<K: CollectorKind> CollectorControl for Runtime<K> {
    fn start(&self) -> Result<(), StartError> {
        if K::slot().is_installed() {
            debug!("{} already collecting on this thread", K::NAME);
            return Ok(());
        }
        let mut header = DataHeader::for_current_thread(&self.config.experiment, K::NAME);
        if let Some(rank) = network::connected_rank() {
            header.rank = rank;
        }
        let sink = (self.sinks)(&header)?;
        let (buffer, source, options) = K::build(&self.config)?;
        let rank = header.rank;
        let mut collector = ThreadCollector::start(header, buffer, sink, source, options)?;
        // Without MPI no rank ever arrives.
        if !self.config.mpi && collector.awaits_rank() {
            if let Err(err) = collector.connect(rank) {
                warn!("could not connect to the collection server: {}", err);
            }
        }
        K::slot().install(collector);
        Ok(())
    }

    fn pause(&self) {
        self.with_collector(|collector| collector.pause());
    }

    fn resume(&self) {
        self.with_collector(|collector| collector.resume());
    }

    fn flush(&self) {
        self.with_collector(|collector| collector.flush());
    }

    fn stop(&self) -> Option<FlushStats> {
        let mut collector = K::slot().take()?;
        Some(collector.stop())
    }

    fn status(&self) -> Option<CollectionStatus> {
        self.with_collector(|collector| collector.status())
    }

    fn connect(&self, rank: i32) -> Result<(), SinkError> {
        self.with_collector(|collector| collector.connect(rank))
            .unwrap_or(Ok(()))
    }

    fn awaits_rank(&self) -> bool {
        self.with_collector(|collector| collector.awaits_rank())
            .unwrap_or(false)
    }

    fn restart_in_child(&self) -> Result<(), StartError> {
        network::forget_after_fork();
        let sinks = self.sinks.clone();
        self.with_collector(|collector| {
            let mut header = collector.header().clone();
            header.refresh_identity();
            let sink = sinks(&header)?;
            collector.restart_in_child(sink)
        })
        .unwrap_or(Ok(()))
    }

    fn record_linked_objects(&self, library: Option<&str>) {
        if !K::slot().is_installed() {
            return;
        }
        match dso::linked_objects(library) {
            Ok(objects) => {
                self.with_collector(|collector| collector.send_linked_objects(&objects));
            }
            Err(err) => warn!("could not record linked objects: {}", err),
        }
    }
}

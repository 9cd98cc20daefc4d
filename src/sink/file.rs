use super::{FailurePolicy, SinkError, TransmissionSink};

use perfcollect_proto::DataHeader;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Appends blobs to one data file per thread.
///
/// The file is opened when the thread starts collecting, so nothing has to
/// be allocated or opened while flushing.
pub struct FileSink {
    path: PathBuf,
    file: File,
}

impl FileSink {
    pub fn create(dir: &Path, header: &DataHeader) -> Result<Self, SinkError> {
        let path = Self::path_for(dir, header);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| SinkError::Open {
                path: path.clone(),
                source,
            })?;
        debug!("writing collector data to {}", path.display());
        Ok(FileSink { path, file })
    }

    /// `<dir>/<collector>-<host>-<pid>-<tid>.cbtf-data`
    pub fn path_for(dir: &Path, header: &DataHeader) -> PathBuf {
        dir.join(format!(
            "{}-{}-{}-{}.cbtf-data",
            header.collector, header.host, header.pid, header.posix_tid
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TransmissionSink for FileSink {
    fn send(&mut self, _header: &DataHeader, blob: &[u8]) -> Result<(), SinkError> {
        self.file
            .write_all(blob)
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })
    }

    fn failure_policy(&self) -> FailurePolicy {
        FailurePolicy::Abort
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use perfcollect_proto::decode_blobs;

    fn header() -> DataHeader {
        DataHeader {
            collector: "pcsamp".into(),
            host: "node7".into(),
            pid: 10,
            posix_tid: 11,
            ..Default::default()
        }
    }

    #[test]
    fn test_file_is_named_after_the_thread() {
        let path = FileSink::path_for(Path::new("/data"), &header());
        assert_eq!(path, PathBuf::from("/data/pcsamp-node7-10-11.cbtf-data"));
    }

    #[test]
    fn test_blobs_are_appended() {
        // Given
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::create(dir.path(), &header()).unwrap();
        assert!(sink.path().exists());

        let mut first = Vec::new();
        perfcollect_proto::encode_blob(&header(), &EmptyPcSamp, &mut first);

        // When
        sink.send(&header(), &first).unwrap();
        sink.send(&header(), &first).unwrap();

        // Then
        let bytes = std::fs::read(sink.path()).unwrap();
        assert_eq!(decode_blobs(&bytes).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileSink::create(&dir.path().join("missing"), &header());
        assert!(matches!(result, Err(SinkError::Open { .. })));
    }

    #[test]
    fn test_failures_abort() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path(), &header()).unwrap();
        assert_eq!(sink.failure_policy(), FailurePolicy::Abort);
    }

    struct EmptyPcSamp;

    impl perfcollect_proto::BlobPayload for EmptyPcSamp {
        fn kind(&self) -> perfcollect_proto::PayloadKind {
            perfcollect_proto::PayloadKind::PcSamp
        }

        fn encoded_len(&self) -> usize {
            0
        }

        fn encode_raw(&self, _buf: &mut impl prost::bytes::BufMut) {}
    }
}

//! Data headers stamped onto every flushed blob.

use perfcollect_metadata::{hostname, TaskKey};
pub use perfcollect_proto::DataHeader;
use prost::Message;

/// Half-open `[begin, end)` range of addresses observed in one epoch.
///
/// Starts out empty as `(u64::MAX, 0)` and widens monotonically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub begin: u64,
    pub end: u64,
}

impl AddressRange {
    pub const EMPTY: AddressRange = AddressRange {
        begin: u64::MAX,
        end: 0,
    };

    pub fn widen(&mut self, address: u64) {
        self.begin = self.begin.min(address);
        self.end = self.end.max(address.saturating_add(1));
    }

    pub fn widen_all(&mut self, addresses: &[u64]) {
        for address in addresses {
            self.widen(*address);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn reset(&mut self) {
        *self = Self::EMPTY;
    }
}

impl Default for AddressRange {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// Header helpers shared by every collector.
pub trait DataHeaderExt {
    /// Partial header for the calling thread. Times and extrema are filled in
    /// when collection starts.
    fn for_current_thread(experiment: &str, collector: &str) -> Self;
    /// Re-reads pid and tid, used by a forked child.
    fn refresh_identity(&mut self);
    /// Starts a new epoch at `time_begin` with empty extrema.
    fn begin_epoch(&mut self, time_begin: u64);
    /// Closes the current epoch.
    fn stamp(&mut self, range: AddressRange, time_end: u64);
    fn address_range(&self) -> AddressRange;
    /// Encoded length of this header once every numeric field takes its
    /// widest encoding.
    fn max_encoded_len(&self) -> usize;
}

impl DataHeaderExt for DataHeader {
    fn for_current_thread(experiment: &str, collector: &str) -> Self {
        let task = TaskKey::current();
        let mut header = DataHeader {
            experiment: experiment.to_string(),
            collector: collector.to_string(),
            host: hostname().to_string(),
            pid: task.pid.into(),
            posix_tid: task.tid as u64,
            rank: -1,
            omp_tid: -1,
            ..Default::default()
        };
        header.begin_epoch(u64::MAX);
        header
    }

    fn refresh_identity(&mut self) {
        let task = TaskKey::current();
        self.pid = task.pid.into();
        self.posix_tid = task.tid as u64;
    }

    fn begin_epoch(&mut self, time_begin: u64) {
        self.time_begin = time_begin;
        self.time_end = 0;
        self.addr_begin = AddressRange::EMPTY.begin;
        self.addr_end = AddressRange::EMPTY.end;
    }

    fn stamp(&mut self, range: AddressRange, time_end: u64) {
        self.time_end = time_end;
        self.addr_begin = range.begin;
        self.addr_end = range.end;
    }

    fn address_range(&self) -> AddressRange {
        AddressRange {
            begin: self.addr_begin,
            end: self.addr_end,
        }
    }

    fn max_encoded_len(&self) -> usize {
        DataHeader {
            pid: -1,
            posix_tid: u64::MAX,
            rank: -1,
            omp_tid: -1,
            time_begin: u64::MAX,
            time_end: u64::MAX,
            addr_begin: u64::MAX,
            addr_end: u64::MAX,
            ..self.clone()
        }
        .encoded_len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::single(&[0x400], 0x400, 0x401)]
    #[case::unordered(&[0x300, 0x100, 0x200], 0x100, 0x301)]
    #[case::repeated(&[0x100, 0x100], 0x100, 0x101)]
    #[case::top_of_address_space(&[u64::MAX], u64::MAX, u64::MAX)]
    fn test_address_range_widens(
        #[case] addresses: &[u64],
        #[case] begin: u64,
        #[case] end: u64,
    ) {
        let mut range = AddressRange::EMPTY;
        range.widen_all(addresses);
        assert_eq!(range, AddressRange { begin, end });
    }

    #[test]
    fn test_address_range_reset() {
        let mut range = AddressRange::EMPTY;
        assert!(range.is_empty());
        range.widen(0x10);
        assert!(!range.is_empty());
        range.reset();
        assert_eq!(range, AddressRange { begin: !0, end: 0 });
    }

    #[test]
    fn test_header_for_current_thread() {
        let header = DataHeader::for_current_thread("exp", "pcsamp");
        assert_eq!(header.collector, "pcsamp");
        assert_eq!(header.pid, std::process::id() as i64);
        assert_eq!(header.rank, -1);
        assert_eq!(header.address_range(), AddressRange::EMPTY);
        assert_eq!(header.time_end, 0);
    }

    #[test]
    fn test_max_encoded_len_bounds_any_epoch() {
        let mut header = DataHeader::for_current_thread("exp", "usertime");
        let bound = header.max_encoded_len();
        header.rank = 12;
        header.begin_epoch(u64::MAX - 1);
        header.stamp(AddressRange { begin: 1 << 62, end: u64::MAX }, u64::MAX);
        assert!(header.encoded_len() <= bound);
    }

    #[test]
    fn test_epochs() {
        // Given
        let mut header = DataHeader::for_current_thread("exp", "pcsamp");
        header.begin_epoch(100);
        let mut range = AddressRange::EMPTY;
        range.widen_all(&[0x10, 0x20]);

        // When
        header.stamp(range, 200);

        // Then
        assert_eq!((header.time_begin, header.time_end), (100, 200));
        assert_eq!((header.addr_begin, header.addr_end), (0x10, 0x21));

        header.begin_epoch(header.time_end);
        assert_eq!(header.time_begin, 200);
        assert_eq!(header.address_range(), AddressRange::EMPTY);
    }
}

//! Configuration from the `CBTF_*` environment. The environment and the
//! logging subscriber are process-wide, so this binary holds a single test.

use perfcollect::collector::pcsamp::PcSamp;
use perfcollect::collector::{CollectorControl, Runtime};
use perfcollect::lifecycle::CollectionStatus;
use tracing::level_filters::LevelFilter;

#[test]
fn test_runtime_from_env() {
    let dir = tempfile::tempdir().unwrap();
    std::env::set_var("CBTF_PCSAMP_RATE", "250");
    std::env::set_var("CBTF_DEBUG_COLLECTOR", "true");
    std::env::set_var("CBTF_RAWDATA_DIR", dir.path());

    let runtime = Runtime::<PcSamp>::from_env().unwrap();

    assert_eq!(runtime.config().pcsamp_rate, 250);
    assert!(runtime.config().debug_collector);
    assert_eq!(runtime.config().rawdata_dir, dir.path());
    assert_eq!(LevelFilter::current(), LevelFilter::DEBUG);

    std::thread::spawn(move || {
        runtime.start().unwrap();
        assert_eq!(runtime.status(), Some(CollectionStatus::Started));
        let mut acc = 0u64;
        for i in 0..10_000_000u64 {
            acc = acc.rotate_left(3) ^ i;
        }
        std::hint::black_box(acc);
        runtime.stop().unwrap();
    })
    .join()
    .unwrap();
    // Data files are created when collection starts.
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

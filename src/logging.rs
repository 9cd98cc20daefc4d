//! Log output of collectors running inside a profiled process.

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Level collectors log at: everything when debugging, otherwise only what
/// needs attention.
pub fn level(debug_collector: bool) -> Level {
    if debug_collector {
        Level::DEBUG
    } else {
        Level::WARN
    }
}

/// Installs a stderr subscriber unless the host process already set one.
/// Returns whether ours was installed.
pub fn init(debug_collector: bool) -> bool {
    FmtSubscriber::builder()
        .with_max_level(level(debug_collector))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_thread_ids(true)
        .try_init()
        .is_ok()
}

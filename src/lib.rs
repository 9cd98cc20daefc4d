pub mod buffer;
pub mod collector;
pub mod config;
pub mod dso;
pub mod flush;
pub mod header;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod profile;
pub mod sink;
pub mod source;
pub mod stacks;
pub mod util;

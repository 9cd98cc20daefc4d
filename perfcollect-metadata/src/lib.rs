pub mod system_metadata;
pub mod task_metadata;

pub use system_metadata::hostname;
pub use task_metadata::TaskKey;

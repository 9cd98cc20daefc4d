mod address;
mod arch;
mod time;

pub use address::address_of;
pub use arch::architecture;
pub use arch::blob_size_factor;
pub use arch::program_counter;
pub use arch::Architecture;
pub use time::now;

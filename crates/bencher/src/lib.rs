mod address;
pub mod client;
pub mod loadgen;
mod options;
pub mod output;
pub mod workload;

pub use address::ServerAddr;
pub use options::{BenchConfig, Options};
pub use workload::{Selection, Template};

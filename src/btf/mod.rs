//! BTF table construction and serialization.

mod types;
mod writer;

pub use types::*;
pub use writer::*;

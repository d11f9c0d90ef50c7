//! Stream processors: one adapter per backing store.

mod local;
mod processor;

#[cfg(test)]
pub(crate) mod testing;

pub use local::*;
pub use processor::*;

//! Batch coordination of ingestion transactions.

mod driver;
mod fingerprint;

pub use driver::*;
pub use fingerprint::*;

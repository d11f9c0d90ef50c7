//! Per-record transaction: state machine, staging and the two-phase protocol.

mod ingestion;
mod staging;
mod state;

pub use ingestion::*;
pub use staging::*;
pub use state::*;

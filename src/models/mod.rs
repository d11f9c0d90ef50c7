//! Core data models for tristream.
//!
//! - Records and run outcomes (`record`)
//! - Stream, phase and staged payload types (`state`)
//! - Configuration and errors

mod config;
mod error;
mod record;
mod state;

pub use config::*;
pub use error::*;
pub use record::*;
pub use state::*;

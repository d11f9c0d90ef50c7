//! Error types for tristream.
//!
//! Taxonomy:
//! - Input: missing or unusable record content (surfaces as a skip, not a failure)
//! - Stream: a processor rejected prepare/commit/rollback
//! - Infrastructure: IO, timeouts
//! - Internal: invariant violations such as an illegal phase transition (bugs)

use crate::models::{Phase, StreamName};
use thiserror::Error;

/// Top-level error type for tristream.
#[derive(Debug, Error)]
pub enum TristreamError {
    // ═══════════════════════════════════════════════════════════════════
    // Expected failures
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Stream {stream} error: {message}")]
    Stream { stream: StreamName, message: String },

    // ═══════════════════════════════════════════════════════════════════
    // Infrastructure
    // ═══════════════════════════════════════════════════════════════════

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // Invariant violations (bugs, never retried)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidPhase { from: Phase, to: Phase },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TristreamError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a stream error.
    pub fn stream(stream: StreamName, message: impl Into<String>) -> Self {
        Self::Stream {
            stream,
            message: message.into(),
        }
    }

    /// Check if this error is worth another commit attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Stream { .. } | Self::Io { .. })
    }
}

/// Result type alias for tristream.
pub type Result<T> = std::result::Result<T, TristreamError>;

//! Custom error types for the acquisition runtime.
//!
//! This module defines the primary error type, `AcqError`, for the entire
//! crate. Using the `thiserror` crate, it provides one consistent taxonomy
//! for everything that can go wrong between configuration and finalized
//! storage.
//!
//! ## Error Hierarchy
//!
//! - **`Settings`**: Wraps errors from the `config` crate: file parsing or
//!   format issues in the application settings.
//! - **`Config`**: Semantic errors in an acquisition configuration: a stream
//!   references an unselected device, a chunk layout is inconsistent with a
//!   shard layout, a dimension list is malformed. Raised synchronously by
//!   [`apply_configuration`](crate::runtime::Runtime::apply_configuration).
//! - **`IllegalState`**: The operation is valid, but not in the current
//!   lifecycle state: starting twice, triggering a stream that is not
//!   running, starting with no camera configured.
//! - **`NotFound`**: A device selection pattern matched nothing, or a stream
//!   index is out of range.
//! - **`UnsupportedCapability`**: The selected storage backend cannot honor a
//!   requested feature (chunking, sharding, multiscale, compression).
//! - **`Invalidated`**: A frame handle was used after its packet's retrieval
//!   scope ended.
//! - **`Io`**: Sink write failures and other I/O. Fatal to the affected
//!   stream; surfaced at the next call touching that stream.
//! - **`StreamFault`**: Carries a stream id alongside the failure that took
//!   the stream down, so callers can reconstruct the failing call.
//!
//! `#[from]` conversions let library code propagate with `?` throughout.

use thiserror::Error;

/// Convenience alias for results using the runtime error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation invalid in the current state: {0}")]
    IllegalState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage device '{device}' does not support {feature}")]
    UnsupportedCapability { device: String, feature: String },

    #[error("Frame handle used after its packet was released")]
    Invalidated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream {stream} fault: {reason}")]
    StreamFault { stream: usize, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Internal channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl AcqError {
    /// Wrap an error as a per-stream fault, preserving the stream id.
    pub fn stream_fault(stream: usize, err: impl std::fmt::Display) -> Self {
        Self::StreamFault {
            stream,
            reason: err.to_string(),
        }
    }
}

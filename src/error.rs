//! Error types for the GEMM engine

use thiserror::Error;

/// Result type for engine operations
pub type GemmResult<T> = Result<T, GemmError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum GemmError {
    /// Bad geometry, non-multiple dimensions or mismatched stage traffic.
    /// Always reported before any channel is created.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A value (or a worst-case partial sum) does not fit its declared width
    #[error("Range error: {message}")]
    Range { message: String },

    #[error("Channel '{channel}' closed by its peer stage")]
    ChannelClosed { channel: &'static str },

    #[error("Stage '{stage}' panicked")]
    StagePanic { stage: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),
}

impl GemmError {
    pub fn config(msg: impl Into<String>) -> Self {
        GemmError::Config { message: msg.into() }
    }

    pub fn range(msg: impl Into<String>) -> Self {
        GemmError::Range { message: msg.into() }
    }

    pub fn closed(channel: &'static str) -> Self {
        GemmError::ChannelClosed { channel }
    }

    /// Errors that are only a consequence of another stage failing first
    pub fn is_induced(&self) -> bool {
        matches!(self, GemmError::ChannelClosed { .. })
    }
}

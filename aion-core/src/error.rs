//! Error types for Aion

use thiserror::Error;

/// Result type alias for Aion operations
pub type Result<T> = std::result::Result<T, AionError>;

/// Aion error types
#[derive(Error, Debug)]
pub enum AionError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// Malformed bucket code stream
    #[error("Codec error: {0}")]
    Codec(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Aggregator name not known to the factory
    #[error("Unknown aggregator: {0}")]
    UnknownAggregator(String),

    /// Entry rejected before it reached any store
    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    /// Bucket repository failure
    #[error("Repository error: {0}")]
    Repository(String),

    /// Level index out of range
    #[error("Level not found: {0}")]
    LevelNotFound(usize),

    /// Query was cancelled by its consumer
    #[error("Query cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AionError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, AionError::Io(_) | AionError::Repository(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            AionError::Corruption(_)
                | AionError::ChecksumMismatch { .. }
                | AionError::Codec(_)
                | AionError::Compression(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(AionError::Repository("down".into()).is_retryable());
        assert!(!AionError::Config("bad".into()).is_retryable());
        assert!(AionError::Codec("truncated".into()).is_corruption());
        assert!(AionError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
        assert!(!AionError::Cancelled.is_corruption());
    }
}

//! Decode error types.

/// Errors raised while decoding a header or a range of LOD blocks.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Fewer bytes than the layout requires.
    #[error("truncated data: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The header could not be parsed.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// A block's contents do not match its declared level or layout.
    #[error("corrupt block for level {lod}: {reason}")]
    CorruptBlock {
        /// Level being decoded.
        lod: u8,
        /// What was wrong.
        reason: String,
    },

    /// The decoder panicked; the worker survived and reports it instead.
    #[error("decoder panicked: {0}")]
    DecoderPanicked(String),

    /// A decoded delta does not fit the geometry it extends.
    #[error("inconsistent delta for level {lod}: {reason}")]
    Inconsistent {
        /// Level of the delta.
        lod: u8,
        /// What was wrong.
        reason: String,
    },
}

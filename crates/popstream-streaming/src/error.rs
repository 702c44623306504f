//! Streaming error types.

use popstream_lod::PolicyError;
use popstream_parser::{DecodeError, StreamId};

/// A byte-range fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The loader does not know the resource.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// The requested bytes lie outside the resource.
    #[error("range {start}..{end} outside resource of {len} bytes")]
    OutOfRange {
        /// First requested byte.
        start: u64,
        /// One past the last requested byte.
        end: u64,
        /// Resource length.
        len: u64,
    },

    /// The loader returned fewer bytes than requested.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Bytes requested.
        expected: u64,
        /// Bytes received.
        actual: u64,
    },

    /// Transport-level failure reported by the loader.
    #[error("i/o error: {0}")]
    Io(String),
}

/// Invalid streaming options.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionsError {
    #[error("max active parsers must be at least 1")]
    NoParsers,

    #[error("error tolerance threshold must be finite and non-negative, got {0}")]
    InvalidThreshold(f32),

    #[error("blending period must be finite and non-negative, got {0} ms")]
    InvalidBlendingPeriod(f32),

    #[error("fetch timeout must be positive, got {0} ms")]
    InvalidFetchTimeout(f32),
}

/// Errors surfaced by the streaming extension and scheduler.
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The stream was never opened or has been closed.
    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    /// LOD data was requested before the stream header arrived.
    #[error("header of {0} has not been loaded yet")]
    HeaderPending(StreamId),

    /// The parser pool could not start its workers.
    #[error("failed to start parser pool: {0}")]
    PoolStart(#[source] std::io::Error),
}

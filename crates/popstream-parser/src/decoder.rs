//! The decoding capability the parser pool runs on its workers.

use popstream_lod::LodRange;

use crate::error::DecodeError;
use crate::geometry::{GeometryDelta, StreamHeader};

/// Turns fetched bytes into stream headers and geometry deltas.
///
/// The encoding itself is opaque to the streaming core; implementations are
/// shared across worker threads.
pub trait PopDecoder: Send + Sync {
    /// Number of bytes a header-only load must fetch.
    fn header_length(&self) -> u64;

    /// Parse the header from the first [`header_length`](Self::header_length) bytes.
    fn parse_header(&self, bytes: &[u8]) -> Result<StreamHeader, DecodeError>;

    /// Decode the contiguous blocks of `range`, returning one delta per level
    /// in increasing level order.
    fn decode(
        &self,
        header: &StreamHeader,
        range: LodRange,
        bytes: &[u8],
    ) -> Result<Vec<GeometryDelta>, DecodeError>;
}

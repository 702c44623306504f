//! Decoding side of POP geometry streaming: stream headers, geometry deltas,
//! the decoder capability, and the bounded parser pool.

mod decoder;
mod error;
mod geometry;
mod pool;
pub mod synthetic;

pub use decoder::PopDecoder;
pub use error::DecodeError;
pub use geometry::{GeometryDelta, LevelBlock, PopVertex, StreamHeader, StreamId};
pub use pool::{ParseJob, ParseKind, ParseResult, ParsedPayload, ParserPool, Ticket};

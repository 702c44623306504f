//! Stream headers and decoded geometry deltas.

use std::fmt;
use std::ops::Range;

use popstream_lod::{BoundingSphere, LodRange, PolicyError};

/// Identifier of one streamed geometry instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Vertex layout of POP geometry, ready for buffer upload.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct PopVertex {
    /// Object-space position.
    pub position: [f32; 3],
    /// Object-space normal.
    pub normal: [f32; 3],
}

/// Location and precision of one LOD level inside the encoded resource.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LevelBlock {
    /// Byte offset of the block from the start of the resource.
    pub offset: u64,
    /// Byte length of the block.
    pub length: u64,
    /// Geometric error of the geometry once this level is applied.
    pub geometric_error: f32,
}

/// Everything known about a stream after its header-only load.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamHeader {
    /// Object-space bounds of the full-detail geometry.
    pub bounds: BoundingSphere,
    /// One block per level, coarsest first. Blocks are laid out contiguously.
    pub levels: Vec<LevelBlock>,
}

impl StreamHeader {
    /// Finest level encoded in the stream.
    pub fn finest_lod(&self) -> u8 {
        self.levels.len().saturating_sub(1).min(usize::from(u8::MAX)) as u8
    }

    pub fn block_lengths(&self) -> Vec<u64> {
        self.levels.iter().map(|b| b.length).collect()
    }

    pub fn level_errors(&self) -> Vec<f32> {
        self.levels.iter().map(|b| b.geometric_error).collect()
    }

    /// Byte range covering every block of `range`.
    pub fn byte_range(&self, range: LodRange) -> Result<Range<u64>, PolicyError> {
        let not_representable = || PolicyError::NotRepresentable {
            min: range.min,
            max: range.max,
            finest: self.finest_lod(),
        };
        let first = self
            .levels
            .get(usize::from(range.min))
            .ok_or_else(not_representable)?;
        let last = self
            .levels
            .get(usize::from(range.max))
            .ok_or_else(not_representable)?;
        let end = last
            .offset
            .checked_add(last.length)
            .ok_or_else(not_representable)?;
        if end < first.offset {
            return Err(not_representable());
        }
        Ok(first.offset..end)
    }
}

/// Geometry added by a single LOD level.
///
/// Indices address the stream's cumulative vertex buffer, so deltas must be
/// applied in level order.
#[derive(Clone, Debug, PartialEq)]
pub struct GeometryDelta {
    /// Level this delta refines the geometry to.
    pub lod: u8,
    /// Vertices appended by this level.
    pub vertices: Vec<PopVertex>,
    /// Triangle indices appended by this level.
    pub indices: Vec<u32>,
}

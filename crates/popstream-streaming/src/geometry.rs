//! Cumulative POP geometry published to the renderer.

use std::ops::Range;

use popstream_parser::{GeometryDelta, PopVertex};

/// A decoded delta could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error("level {got} applied out of order, expected level {expected}")]
    OutOfOrder { expected: u8, got: u8 },

    #[error("level {lod} references vertex {index} but only {vertex_count} exist")]
    IndexOutOfBounds {
        lod: u8,
        index: u32,
        vertex_count: usize,
    },
}

/// Vertex and index buffers of one stream, grown one level at a time.
///
/// Every level appends vertices and triangles. Drawing level `n` means
/// drawing the index prefix that ends at level `n`.
#[derive(Clone, Debug, Default)]
pub struct PopGeometry {
    vertices: Vec<PopVertex>,
    indices: Vec<u32>,
    /// Index count once each applied level is included.
    level_index_ends: Vec<usize>,
    /// Vertex count once each applied level is included.
    level_vertex_ends: Vec<usize>,
    active_lod: Option<u8>,
}

impl PopGeometry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level the next delta must refine to.
    pub fn next_lod(&self) -> u8 {
        self.level_index_ends.len().min(usize::from(u8::MAX)) as u8
    }

    /// Highest level applied so far.
    pub fn applied_lod(&self) -> Option<u8> {
        self.level_index_ends.len().checked_sub(1).map(|l| l as u8)
    }

    /// Append one level. Levels must arrive in order, starting at 0.
    pub fn apply(&mut self, delta: GeometryDelta) -> Result<u8, ApplyError> {
        let expected = self.next_lod();
        if delta.lod != expected {
            return Err(ApplyError::OutOfOrder {
                expected,
                got: delta.lod,
            });
        }
        let vertex_count = self.vertices.len() + delta.vertices.len();
        if let Some(&index) = delta
            .indices
            .iter()
            .find(|&&i| i as usize >= vertex_count)
        {
            return Err(ApplyError::IndexOutOfBounds {
                lod: delta.lod,
                index,
                vertex_count,
            });
        }

        self.vertices.extend(delta.vertices);
        self.indices.extend(delta.indices);
        self.level_vertex_ends.push(self.vertices.len());
        self.level_index_ends.push(self.indices.len());
        Ok(delta.lod)
    }

    /// Index range to draw for `lod`, `None` if the level is not applied.
    pub fn draw_range(&self, lod: u8) -> Option<Range<usize>> {
        self.level_index_ends
            .get(usize::from(lod))
            .map(|&end| 0..end)
    }

    /// Vertices referenced once `lod` is applied.
    pub fn vertex_count(&self, lod: u8) -> Option<usize> {
        self.level_vertex_ends.get(usize::from(lod)).copied()
    }

    /// Select the level the renderer draws. Ignored for levels not yet applied.
    pub fn set_active_lod(&mut self, lod: u8) {
        if self.applied_lod().is_some_and(|applied| lod <= applied) {
            self.active_lod = Some(lod);
        }
    }

    pub fn active_lod(&self) -> Option<u8> {
        self.active_lod
    }

    /// Indices to draw for the active level.
    pub fn active_indices(&self) -> &[u32] {
        match self.active_lod.and_then(|lod| self.draw_range(lod)) {
            Some(range) => &self.indices[range],
            None => &[],
        }
    }

    pub fn vertices(&self) -> &[PopVertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    /// Raw vertex data for buffer upload.
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Raw index data for buffer upload.
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }
}

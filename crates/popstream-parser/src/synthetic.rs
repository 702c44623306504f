//! Synthetic POP meshes and a minimal block layout for them.
//!
//! Used by the demo binary and by tests to stand in for real assets. The
//! layout is a fixed-size header (magic, level table, bounds) followed by one
//! block per level; it is not meant as an interchange format.

use glam::Vec3;
use popstream_lod::{BoundingSphere, LodRange, pop_level_error};

use crate::decoder::PopDecoder;
use crate::error::DecodeError;
use crate::geometry::{GeometryDelta, LevelBlock, PopVertex, StreamHeader};

const MAGIC: &[u8; 4] = b"POPS";
/// Most levels the fixed-size header can describe.
pub const MAX_LEVELS: usize = 16;
const TABLE_ENTRY_LENGTH: usize = 24;
const HEADER_PREFIX_LENGTH: usize = 24;
/// Size of the header fetched by a header-only load.
pub const HEADER_LENGTH: u64 = (HEADER_PREFIX_LENGTH + MAX_LEVELS * TABLE_ENTRY_LENGTH) as u64;
const BLOCK_PREFIX_LENGTH: usize = 12;
const VERTEX_LENGTH: usize = 24;

/// A procedurally generated mesh split into POP levels.
#[derive(Clone, Debug)]
pub struct SyntheticMesh {
    pub bounds: BoundingSphere,
    pub deltas: Vec<GeometryDelta>,
}

impl SyntheticMesh {
    /// Points scattered over a sphere, refined over `levels` levels.
    ///
    /// Level 0 holds independent triangles; every later triangle reuses one
    /// vertex from an earlier level, so levels only make sense in order.
    pub fn sphere(levels: u8, radius: f32) -> Self {
        let levels = usize::from(levels).clamp(1, MAX_LEVELS) as u8;
        let mut deltas = Vec::with_capacity(usize::from(levels));
        let mut vertex_count = 0u32;
        let mut point = 0u32;

        for lod in 0..levels {
            let triangles = 4 * (u32::from(lod) + 1);
            let mut vertices = Vec::new();
            let mut indices = Vec::new();
            for t in 0..triangles {
                let base = vertex_count + vertices.len() as u32;
                if lod == 0 {
                    for _ in 0..3 {
                        vertices.push(sphere_vertex(point, radius));
                        point += 1;
                    }
                    indices.extend_from_slice(&[base, base + 1, base + 2]);
                } else {
                    vertices.push(sphere_vertex(point, radius));
                    vertices.push(sphere_vertex(point + 1, radius));
                    point += 2;
                    let shared = (t * 7) % vertex_count;
                    indices.extend_from_slice(&[base, base + 1, shared]);
                }
            }
            vertex_count += vertices.len() as u32;
            deltas.push(GeometryDelta { lod, vertices, indices });
        }

        Self {
            bounds: BoundingSphere::new(Vec3::ZERO, radius),
            deltas,
        }
    }

    /// Header describing [`encode`](Self::encode)'s output.
    pub fn header(&self) -> StreamHeader {
        let extent = self.bounds.radius * 2.0;
        let mut offset = HEADER_LENGTH;
        let levels = self
            .deltas
            .iter()
            .map(|delta| {
                let length = block_length(delta) as u64;
                let block = LevelBlock {
                    offset,
                    length,
                    geometric_error: pop_level_error(extent, delta.lod),
                };
                offset += length;
                block
            })
            .collect();
        StreamHeader {
            bounds: self.bounds,
            levels,
        }
    }

    /// Encode header and blocks into one resource.
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let mut out = Vec::with_capacity(
            header
                .levels
                .last()
                .map_or(HEADER_LENGTH, |b| b.offset + b.length) as usize,
        );

        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(header.levels.len() as u32).to_le_bytes());
        for v in header.bounds.center.to_array() {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&header.bounds.radius.to_le_bytes());
        for slot in 0..MAX_LEVELS {
            let block = header.levels.get(slot).copied().unwrap_or(LevelBlock {
                offset: 0,
                length: 0,
                geometric_error: 0.0,
            });
            out.extend_from_slice(&block.offset.to_le_bytes());
            out.extend_from_slice(&block.length.to_le_bytes());
            out.extend_from_slice(&block.geometric_error.to_le_bytes());
            out.extend_from_slice(&[0u8; 4]);
        }

        for delta in &self.deltas {
            out.push(delta.lod);
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&(delta.vertices.len() as u32).to_le_bytes());
            out.extend_from_slice(&(delta.indices.len() as u32).to_le_bytes());
            for vertex in &delta.vertices {
                for v in vertex.position.iter().chain(vertex.normal.iter()) {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            for index in &delta.indices {
                out.extend_from_slice(&index.to_le_bytes());
            }
        }
        out
    }
}

/// Overwrite the level tag of `lod`'s block so decoding it fails.
pub fn corrupt_level(encoded: &mut [u8], header: &StreamHeader, lod: u8) {
    if let Some(block) = header.levels.get(usize::from(lod))
        && let Some(tag) = encoded.get_mut(block.offset as usize)
    {
        *tag = tag.wrapping_add(0x80);
    }
}

/// Overwrite the byte offset `lod` has in the encoded level table.
pub fn overwrite_level_offset(encoded: &mut [u8], lod: u8, offset: u64) {
    let start = HEADER_PREFIX_LENGTH + usize::from(lod) * TABLE_ENTRY_LENGTH;
    if let Some(slot) = encoded.get_mut(start..start + 8) {
        slot.copy_from_slice(&offset.to_le_bytes());
    }
}

fn block_length(delta: &GeometryDelta) -> usize {
    BLOCK_PREFIX_LENGTH + delta.vertices.len() * VERTEX_LENGTH + delta.indices.len() * 4
}

fn sphere_vertex(i: u32, radius: f32) -> PopVertex {
    // Fibonacci lattice.
    let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
    let y = 1.0 - (i % 4096) as f32 / 2048.0;
    let r = (1.0 - y * y).max(0.0).sqrt();
    let theta = golden * i as f32;
    let normal = Vec3::new(theta.cos() * r, y, theta.sin() * r);
    PopVertex {
        position: (normal * radius).to_array(),
        normal: normal.to_array(),
    }
}

/// Little-endian cursor over a byte slice.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + len;
        let slice = self.bytes.get(self.pos..end).ok_or(DecodeError::Truncated {
            expected: end,
            actual: self.bytes.len(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

/// Decoder for [`SyntheticMesh::encode`] output.
#[derive(Clone, Copy, Debug, Default)]
pub struct SyntheticDecoder;

impl PopDecoder for SyntheticDecoder {
    fn header_length(&self) -> u64 {
        HEADER_LENGTH
    }

    fn parse_header(&self, bytes: &[u8]) -> Result<StreamHeader, DecodeError> {
        let mut reader = Reader::new(bytes);
        if reader.take(4)? != MAGIC {
            return Err(DecodeError::InvalidHeader("bad magic".into()));
        }
        let count = reader.u32()? as usize;
        if count == 0 || count > MAX_LEVELS {
            return Err(DecodeError::InvalidHeader(format!(
                "level count {count} outside 1..={MAX_LEVELS}"
            )));
        }
        let center = Vec3::new(reader.f32()?, reader.f32()?, reader.f32()?);
        let radius = reader.f32()?;

        let mut levels = Vec::with_capacity(count);
        let mut expected_offset = HEADER_LENGTH;
        for lod in 0..count {
            let offset = reader.u64()?;
            let length = reader.u64()?;
            let geometric_error = reader.f32()?;
            reader.take(4)?;
            // Blocks follow the header back to back, coarsest first.
            if offset != expected_offset {
                return Err(DecodeError::InvalidHeader(format!(
                    "level {lod} starts at byte {offset}, expected {expected_offset}"
                )));
            }
            expected_offset = offset.checked_add(length).ok_or_else(|| {
                DecodeError::InvalidHeader(format!("level {lod} length {length} overflows"))
            })?;
            levels.push(LevelBlock {
                offset,
                length,
                geometric_error,
            });
        }

        Ok(StreamHeader {
            bounds: BoundingSphere::new(center, radius),
            levels,
        })
    }

    fn decode(
        &self,
        header: &StreamHeader,
        range: LodRange,
        bytes: &[u8],
    ) -> Result<Vec<GeometryDelta>, DecodeError> {
        let mut reader = Reader::new(bytes);
        let mut deltas = Vec::with_capacity(range.level_count());

        for lod in range.iter() {
            let corrupt = |reason: String| DecodeError::CorruptBlock { lod, reason };
            let block = header
                .levels
                .get(usize::from(lod))
                .ok_or_else(|| corrupt("level missing from header".into()))?;
            let start = reader.pos;

            let tag = reader.u8()?;
            if tag != lod {
                return Err(corrupt(format!("block tagged as level {tag}")));
            }
            reader.take(3)?;
            let vertex_count = reader.u32()? as usize;
            let index_count = reader.u32()? as usize;
            let expected = BLOCK_PREFIX_LENGTH + vertex_count * VERTEX_LENGTH + index_count * 4;
            if expected as u64 != block.length {
                return Err(corrupt(format!(
                    "block is {expected} bytes, header says {}",
                    block.length
                )));
            }

            let mut vertices = Vec::with_capacity(vertex_count);
            for _ in 0..vertex_count {
                let mut v = [0f32; 6];
                for slot in &mut v {
                    *slot = reader.f32()?;
                }
                vertices.push(PopVertex {
                    position: [v[0], v[1], v[2]],
                    normal: [v[3], v[4], v[5]],
                });
            }
            let mut indices = Vec::with_capacity(index_count);
            for _ in 0..index_count {
                indices.push(reader.u32()?);
            }
            debug_assert_eq!((reader.pos - start) as u64, block.length);

            deltas.push(GeometryDelta {
                lod,
                vertices,
                indices,
            });
        }

        Ok(deltas)
    }
}

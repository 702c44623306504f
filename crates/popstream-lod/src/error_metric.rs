//! Screen-space error LOD selection.
//!
//! Each LOD level carries a geometric error in object units. Projected to the
//! screen it becomes a pixel error; the required level is the coarsest one
//! whose pixel error is within the tolerance threshold.

use crate::view::{BoundingSphere, Frustum, ViewParams};

/// Geometric error of a POP level whose positions are quantized on a grid of
/// `2^(lod + 1)` cells across `extent`.
pub fn pop_level_error(extent: f32, lod: u8) -> f32 {
    extent / 2f32.powi(i32::from(lod) + 1)
}

/// Distance from the camera to the surface of the sphere, zero when inside.
pub fn distance_to_sphere(camera: glam::Vec3, sphere: &BoundingSphere) -> f32 {
    ((camera - sphere.center).length() - sphere.radius).max(0.0)
}

/// Picks the required LOD from projected screen-space error.
#[derive(Clone, Copy, Debug)]
pub struct ErrorToleranceSelector {
    threshold: f32,
}

impl ErrorToleranceSelector {
    /// `threshold` is the tolerated error in pixels; `0` (or less) means
    /// refine to the finest available level.
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Pick the coarsest level whose projected error is within tolerance.
    ///
    /// `level_errors[i]` is the geometric error of level `i`, expected to be
    /// non-increasing. Falls back to the finest level if none qualifies.
    pub fn select_lod(&self, level_errors: &[f32], pixels_per_unit: f32) -> u8 {
        let finest = level_errors.len().saturating_sub(1).min(usize::from(u8::MAX)) as u8;
        if self.threshold <= 0.0 {
            return finest;
        }
        level_errors
            .iter()
            .position(|error| error * pixels_per_unit <= self.threshold)
            .map_or(finest, |i| i.min(usize::from(finest)) as u8)
    }

    /// Required level for an object with world bounds `sphere`, or `None`
    /// when the object is outside the view frustum.
    pub fn required_lod(
        &self,
        view: &ViewParams,
        frustum: &Frustum,
        sphere: &BoundingSphere,
        level_errors: &[f32],
    ) -> Option<u8> {
        if !frustum.intersects_sphere(sphere) {
            return None;
        }
        let distance = distance_to_sphere(view.position, sphere);
        Some(self.select_lod(level_errors, view.pixels_per_unit(distance)))
    }
}

//! Camera view parameters and sphere-vs-frustum visibility.

use glam::{Mat4, Vec3, Vec4};

/// A bounding sphere in either object or world space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundingSphere {
    /// Center of the sphere.
    pub center: Vec3,
    /// Radius of the sphere (non-negative).
    pub radius: f32,
}

impl BoundingSphere {
    /// Create a new bounding sphere.
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self { center, radius }
    }

    /// Transform the sphere by an affine matrix. The radius is scaled by the
    /// largest axis scale so the result still encloses the geometry.
    pub fn transformed(&self, transform: &Mat4) -> Self {
        let scale = transform
            .x_axis
            .truncate()
            .length()
            .max(transform.y_axis.truncate().length())
            .max(transform.z_axis.truncate().length());
        Self {
            center: transform.transform_point3(self.center),
            radius: self.radius * scale,
        }
    }
}

/// Camera parameters the scheduler needs: position, orientation and
/// perspective projection.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewParams {
    /// Camera position in world space.
    pub position: Vec3,
    /// Unit look direction.
    pub forward: Vec3,
    /// Unit up vector.
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov_y: f32,
    /// Width / height.
    pub aspect_ratio: f32,
    /// Near clip plane distance (positive).
    pub z_near: f32,
    /// Far clip plane distance (positive, > near).
    pub z_far: f32,
    /// Height of the viewport in pixels.
    pub viewport_height: f32,
}

impl ViewParams {
    /// A perspective camera at the origin looking down -Z.
    pub fn perspective(
        fov_y: f32,
        viewport_width: f32,
        viewport_height: f32,
        z_near: f32,
        z_far: f32,
    ) -> Self {
        Self {
            position: Vec3::ZERO,
            forward: Vec3::NEG_Z,
            up: Vec3::Y,
            fov_y,
            aspect_ratio: viewport_width / viewport_height.max(1.0),
            z_near,
            z_far,
            viewport_height,
        }
    }

    /// Place the camera at `eye` looking at `target`.
    pub fn looking_at(mut self, eye: Vec3, target: Vec3, up: Vec3) -> Self {
        self.position = eye;
        self.forward = (target - eye).try_normalize().unwrap_or(Vec3::NEG_Z);
        self.up = up;
        self
    }

    /// Update the projection after a viewport resize.
    pub fn resize(&mut self, width: f32, height: f32) {
        self.aspect_ratio = width / height.max(1.0);
        self.viewport_height = height;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward, self.up)
    }

    /// Perspective projection with depth mapped to `[0, 1]`.
    pub fn projection_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect_ratio, self.z_near, self.z_far)
    }

    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Screen pixels covered by one world unit at `distance` from the camera.
    pub fn pixels_per_unit(&self, distance: f32) -> f32 {
        let distance = distance.max(self.z_near).max(f32::EPSILON);
        self.viewport_height / (2.0 * distance * (self.fov_y * 0.5).tan())
    }

    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection_matrix())
    }
}

const LEFT: usize = 0;
const RIGHT: usize = 1;
const BOTTOM: usize = 2;
const TOP: usize = 3;
const NEAR: usize = 4;
const FAR: usize = 5;

/// A view frustum as six inward-pointing normalized planes.
#[derive(Clone, Debug)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Extract frustum planes from a view-projection matrix whose clip depth
    /// range is `[0, 1]` (Griggs-Hartmann).
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let rows = [vp.row(0), vp.row(1), vp.row(2), vp.row(3)];

        let mut planes = [Vec4::ZERO; 6];
        planes[LEFT] = rows[3] + rows[0];
        planes[RIGHT] = rows[3] - rows[0];
        planes[BOTTOM] = rows[3] + rows[1];
        planes[TOP] = rows[3] - rows[1];
        planes[NEAR] = rows[2];
        planes[FAR] = rows[3] - rows[2];

        for plane in &mut planes {
            let len = plane.truncate().length();
            if len > 0.0 {
                *plane /= len;
            }
        }

        Self { planes }
    }

    /// Returns `true` if the sphere is at least partially inside.
    pub fn intersects_sphere(&self, sphere: &BoundingSphere) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.truncate().dot(sphere.center) + plane.w >= -sphere.radius)
    }
}

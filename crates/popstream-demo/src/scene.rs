//! Procedural scene: synthetic POP meshes scattered on a ground plane and a
//! camera orbiting inwards over the run.

use glam::{Mat4, Quat, Vec3};
use popstream_config::{CameraConfig, SceneConfig};
use popstream_lod::ViewParams;
use popstream_parser::synthetic::SyntheticMesh;
use popstream_streaming::MemoryLoader;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

/// Distinct meshes shared between objects.
const MESH_VARIANTS: usize = 4;

/// One streamed object.
#[derive(Clone, Debug)]
pub struct SceneObject {
    pub resource: String,
    pub transform: Mat4,
}

pub struct DemoScene {
    pub objects: Vec<SceneObject>,
    meshes: Vec<(String, SyntheticMesh)>,
}

impl DemoScene {
    /// Scatter `object_count` objects deterministically from `seed`.
    pub fn generate(config: &SceneConfig) -> Self {
        let mut rng = Xoshiro256StarStar::seed_from_u64(config.seed);
        let variants = MESH_VARIANTS.min(config.object_count.max(1));
        let meshes: Vec<(String, SyntheticMesh)> = (0..variants)
            .map(|i| {
                let radius = 1.0 + i as f32;
                (
                    format!("mesh/sphere_{i}.pop"),
                    SyntheticMesh::sphere(config.levels, radius),
                )
            })
            .collect();

        let spread = config.spread.max(f32::EPSILON);
        let objects = (0..config.object_count)
            .map(|_| {
                let variant = rng.gen_range(0..meshes.len());
                let position = Vec3::new(
                    rng.gen_range(-spread..spread),
                    0.0,
                    rng.gen_range(-spread..spread),
                );
                let yaw = rng.gen_range(0.0..std::f32::consts::TAU);
                let scale = rng.gen_range(0.5..2.0);
                SceneObject {
                    resource: meshes[variant].0.clone(),
                    transform: Mat4::from_scale_rotation_translation(
                        Vec3::splat(scale),
                        Quat::from_rotation_y(yaw),
                        position,
                    ),
                }
            })
            .collect();

        Self { objects, meshes }
    }

    /// Publish every mesh variant to `loader`.
    pub fn publish(&self, loader: &MemoryLoader) {
        for (resource, mesh) in &self.meshes {
            loader.insert(resource.clone(), mesh.encode());
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.meshes.iter().map(|(resource, _)| resource.as_str())
    }
}

/// Camera circling the scene origin with a shrinking radius.
pub struct OrbitCamera {
    camera: CameraConfig,
    start_radius: f32,
    end_radius: f32,
    /// Full turns over the run.
    turns: f32,
}

impl OrbitCamera {
    pub fn new(camera: CameraConfig, scene: &SceneConfig) -> Self {
        Self {
            camera,
            start_radius: scene.orbit_start_radius.max(f32::EPSILON),
            end_radius: scene.orbit_end_radius.max(f32::EPSILON),
            turns: 1.0,
        }
    }

    /// Orbit radius at `progress` in `[0, 1]`, interpolated geometrically so
    /// the approach slows down near the objects.
    pub fn radius_at(&self, progress: f32) -> f32 {
        let t = progress.clamp(0.0, 1.0);
        self.start_radius * (self.end_radius / self.start_radius).powf(t)
    }

    pub fn view_at(&self, progress: f32) -> ViewParams {
        let t = progress.clamp(0.0, 1.0);
        let radius = self.radius_at(t);
        let angle = t * self.turns * std::f32::consts::TAU;
        let eye = Vec3::new(angle.cos() * radius, radius * 0.35, angle.sin() * radius);
        ViewParams::perspective(
            self.camera.fov_y_degrees.to_radians(),
            self.camera.width as f32,
            self.camera.height as f32,
            self.camera.z_near,
            self.camera.z_far,
        )
        .looking_at(eye, Vec3::ZERO, Vec3::Y)
    }
}

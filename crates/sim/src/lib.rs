//! Synthetic RGB-D scenes.
//!
//! A [`SimWorld`] is a room of bounded walls carrying marker landmarks. The
//! [`SimCamera`] raycasts depth images against the walls and renders marker
//! pixels for the landmarks; [`MarkerExtractor`] and [`GridSegmentor`]
//! implement the frame capability traits on top, so the full pipeline runs
//! against simulated data exactly as against a sensor.

mod extractor;
mod segmentor;

pub use extractor::{synthetic_descriptor, MarkerExtractor};
pub use segmentor::GridSegmentor;

use frame::{DepthImage, Intrinsics, RgbImage};
use geometry::{Plane, Transform3D};
use nalgebra::{Point3, Vector3};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A bounded wall: an infinite plane clipped to a rectangle.
#[derive(Debug, Clone)]
pub struct Wall {
    pub plane: Plane,
    pub center: Point3<f64>,
    axis_u: Vector3<f64>,
    axis_v: Vector3<f64>,
    half_u: f64,
    half_v: f64,
}

impl Wall {
    pub fn new(
        center: Point3<f64>,
        normal: Vector3<f64>,
        axis_u: Vector3<f64>,
        half_u: f64,
        axis_v: Vector3<f64>,
        half_v: f64,
    ) -> Self {
        Self {
            plane: Plane::from_point_normal(&center, normal),
            center,
            axis_u: axis_u.normalize(),
            axis_v: axis_v.normalize(),
            half_u,
            half_v,
        }
    }

    fn contains(&self, p: &Point3<f64>) -> bool {
        let d = p - self.center;
        d.dot(&self.axis_u).abs() <= self.half_u && d.dot(&self.axis_v).abs() <= self.half_v
    }

    /// A point on the wall at rectangle coordinates (s, t) in [-1, 1].
    pub fn point_at(&self, s: f64, t: f64) -> Point3<f64> {
        self.center + self.axis_u * (s * self.half_u) + self.axis_v * (t * self.half_v)
    }
}

/// A marker landmark fixed to a wall.
#[derive(Debug, Clone, Copy)]
pub struct SimLandmark {
    pub id: u32,
    pub position: Point3<f64>,
}

/// The simulated scene, expressed in the map frame (the initial camera
/// frame: x right, y down, z forward).
#[derive(Debug, Clone)]
pub struct SimWorld {
    pub walls: Vec<Wall>,
    pub landmarks: Vec<SimLandmark>,
}

impl SimWorld {
    /// A room of five bounded, pairwise non-coplanar walls around the
    /// origin, with marker grids on three of them. Sized so that at least
    /// three walls stay in the frustum over small motions and pans.
    pub fn room() -> Self {
        let front = Wall::new(
            Point3::new(0.1, 0.0, 4.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::x(),
            3.0,
            Vector3::y(),
            2.0,
        );
        let left = Wall::new(
            Point3::new(-1.8, 0.0, 2.2),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::z(),
            2.3,
            Vector3::y(),
            2.0,
        );
        let right = Wall::new(
            Point3::new(2.0, 0.0, 2.2),
            Vector3::new(-1.0, 0.0, 0.0),
            Vector3::z(),
            2.3,
            Vector3::y(),
            2.0,
        );
        let floor = Wall::new(
            Point3::new(0.1, 1.2, 2.2),
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::x(),
            3.0,
            Vector3::z(),
            2.3,
        );
        let ceiling = Wall::new(
            Point3::new(0.1, -1.2, 2.2),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::x(),
            3.0,
            Vector3::z(),
            2.3,
        );

        let mut landmarks = Vec::new();
        let mut id = 0u32;
        let mut sprinkle = |wall: &Wall, nu: i32, nv: i32| {
            for i in 0..nu {
                for j in 0..nv {
                    let s = -0.9 + 1.8 * i as f64 / (nu - 1) as f64;
                    let t = -0.9 + 1.8 * j as f64 / (nv - 1) as f64;
                    landmarks.push(SimLandmark {
                        id,
                        position: wall.point_at(s, t),
                    });
                    id += 1;
                }
            }
        };
        sprinkle(&front, 9, 7);
        sprinkle(&left, 5, 4);
        sprinkle(&right, 5, 4);

        Self {
            walls: vec![front, left, right, floor, ceiling],
            landmarks,
        }
    }
}

/// Sensor noise model. Zero by default (exact geometry).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseConfig {
    /// Gaussian sigma added to rendered depth (meters).
    pub depth_sigma: f64,
}

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    pub noise: NoiseConfig,
    pub seed: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            width: 160,
            height: 120,
            focal: 130.0,
            noise: NoiseConfig::default(),
            seed: 42,
        }
    }
}

/// Renders RGB + depth observations of a [`SimWorld`] from arbitrary poses.
pub struct SimCamera {
    world: SimWorld,
    intrinsics: Intrinsics,
    noise: NoiseConfig,
    rng: StdRng,
}

impl SimCamera {
    pub fn new(world: SimWorld, config: SimConfig) -> Self {
        let intrinsics = Intrinsics {
            fx: config.focal,
            fy: config.focal,
            cx: (config.width as f64 - 1.0) / 2.0,
            cy: (config.height as f64 - 1.0) / 2.0,
            width: config.width,
            height: config.height,
            depth_scale: 1.0,
        };
        Self {
            world,
            intrinsics,
            noise: config.noise,
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.intrinsics
    }

    pub fn world(&self) -> &SimWorld {
        &self.world
    }

    /// Render the scene from `pose` (map frame camera pose).
    pub fn render(&mut self, pose: &Transform3D) -> (RgbImage, DepthImage) {
        let mut rgb = RgbImage::new(self.intrinsics.width, self.intrinsics.height);
        let mut depth = DepthImage::new(self.intrinsics.width, self.intrinsics.height);

        let origin = Point3::from(pose.translation());
        for v in 0..self.intrinsics.height {
            for u in 0..self.intrinsics.width {
                let dir_cam = Vector3::new(
                    (u as f64 - self.intrinsics.cx) / self.intrinsics.fx,
                    (v as f64 - self.intrinsics.cy) / self.intrinsics.fy,
                    1.0,
                );
                let dir_map = pose.transform_vector(&dir_cam);
                let mut nearest = f64::INFINITY;
                for wall in &self.world.walls {
                    let n = wall.plane.normal().into_inner();
                    let denom = n.dot(&dir_map);
                    if denom.abs() < 1e-9 {
                        continue;
                    }
                    let s = -(n.dot(&origin.coords) + wall.plane.d()) / denom;
                    if s <= 0.05 || s >= nearest {
                        continue;
                    }
                    let hit = origin + dir_map * s;
                    if wall.contains(&hit) {
                        nearest = s;
                    }
                }
                if nearest.is_finite() {
                    // s is the camera-frame z because dir_cam.z == 1.
                    let mut z = nearest;
                    if self.noise.depth_sigma > 0.0 {
                        z += self.noise.depth_sigma * gauss(&mut self.rng);
                    }
                    depth.set(u, v, z.max(0.0) as f32);
                    let shade = (40.0 + (z * 25.0).min(160.0)) as u8;
                    rgb.set_pixel(u, v, [shade, shade, shade]);
                }
            }
        }

        // Marker landmarks, occlusion-checked against the depth buffer.
        let cam_from_map = pose.inverse();
        for lm in &self.world.landmarks {
            let p_cam = cam_from_map.transform_point(&lm.position);
            let Some((u, v)) = self.intrinsics.project(&p_cam) else {
                continue;
            };
            if !self.intrinsics.contains(u, v) {
                continue;
            }
            let (ui, vi) = (u.round() as u32, v.round() as u32);
            if ui >= self.intrinsics.width || vi >= self.intrinsics.height {
                continue;
            }
            let rendered = depth.at(ui, vi) as f64;
            if rendered > 0.0 && (rendered - p_cam.z).abs() > 0.1 {
                continue;
            }
            rgb.set_pixel(
                ui,
                vi,
                [(lm.id & 0xFF) as u8, ((lm.id >> 8) & 0xFF) as u8, 255],
            );
        }

        (rgb, depth)
    }
}

/// Standard normal sample (Box-Muller).
fn gauss(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Camera trajectory presets for scenario runs.
#[derive(Debug, Clone, Copy)]
pub enum TrajectoryPreset {
    /// Hold still.
    Static { frames: usize },
    /// Translate along map +x by `distance` meters in equal steps.
    TranslateX { distance: f64, frames: usize },
    /// Pan about the camera's vertical axis by `angle` radians total.
    Pan { angle: f64, frames: usize },
}

/// Ground-truth poses for a preset, starting at identity.
pub fn trajectory(preset: TrajectoryPreset) -> Vec<Transform3D> {
    match preset {
        TrajectoryPreset::Static { frames } => {
            vec![Transform3D::identity(); frames]
        }
        TrajectoryPreset::TranslateX { distance, frames } => (0..frames)
            .map(|i| {
                let x = distance * i as f64 / (frames - 1) as f64;
                Transform3D::from_xyz_rpy(x, 0.0, 0.0, 0.0, 0.0, 0.0)
            })
            .collect(),
        TrajectoryPreset::Pan { angle, frames } => (0..frames)
            .map(|i| {
                let a = angle * i as f64 / (frames - 1) as f64;
                // The camera's vertical axis is y (optical convention).
                Transform3D::from_xyz_rpy(0.0, 0.0, 0.0, 0.0, a, 0.0)
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_hits_front_wall() {
        let mut cam = SimCamera::new(SimWorld::room(), SimConfig::default());
        let (_, depth) = cam.render(&Transform3D::identity());
        let intr = cam.intrinsics();
        let center = depth.at(intr.cx as u32, intr.cy as u32) as f64;
        assert!((center - 4.0).abs() < 0.05, "center depth {center}");
    }

    #[test]
    fn markers_are_rendered() {
        let mut cam = SimCamera::new(SimWorld::room(), SimConfig::default());
        let (rgb, _) = cam.render(&Transform3D::identity());
        let markers = rgb
            .data
            .chunks(3)
            .filter(|px| px[2] == 255)
            .count();
        assert!(markers > 30, "only {markers} markers visible");
    }

    #[test]
    fn trajectory_lengths() {
        assert_eq!(
            trajectory(TrajectoryPreset::Static { frames: 10 }).len(),
            10
        );
        let path = trajectory(TrajectoryPreset::TranslateX {
            distance: 0.5,
            frames: 30,
        });
        assert!((path.last().unwrap().translation().x - 0.5).abs() < 1e-9);
        let pan = trajectory(TrajectoryPreset::Pan {
            angle: 0.5,
            frames: 20,
        });
        assert!((pan.last().unwrap().rotation_angle() - 0.5).abs() < 1e-9);
    }
}

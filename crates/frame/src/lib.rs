//! Per-observation frame model for RGB-D SLAM.
//!
//! A [`Frame`] bundles one sensor observation: extracted 2D keypoints with
//! descriptors, their 3D back-projections, segmented planes, and the pose
//! written later by the tracker. Feature extraction and plane segmentation
//! are pluggable capabilities ([`FeatureExtractor`], [`PlaneSegmentor`]);
//! the SLAM core only ever sees the traits.

use geometry::{Plane, Transform3D};
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Pinhole camera intrinsics plus sensor geometry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Intrinsics {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    pub width: u32,
    pub height: u32,
    /// Multiplier converting raw depth values to meters.
    pub depth_scale: f64,
}

impl Intrinsics {
    /// Back-project a pixel with a depth in meters to a camera-frame point.
    /// Returns None for missing depth (zero or non-finite).
    pub fn back_project(&self, u: f64, v: f64, depth: f64) -> Option<Point3<f64>> {
        let z = depth * self.depth_scale;
        if !z.is_finite() || z <= 0.0 {
            return None;
        }
        Some(Point3::new(
            (u - self.cx) * z / self.fx,
            (v - self.cy) * z / self.fy,
            z,
        ))
    }

    /// Project a camera-frame point to pixel coordinates.
    /// Returns None for points at or behind the camera.
    pub fn project(&self, p: &Point3<f64>) -> Option<(f64, f64)> {
        if p.z <= 1e-9 {
            return None;
        }
        Some((
            self.fx * p.x / p.z + self.cx,
            self.fy * p.y / p.z + self.cy,
        ))
    }

    /// True when the pixel lies inside the image bounds.
    pub fn contains(&self, u: f64, v: f64) -> bool {
        u >= 0.0 && v >= 0.0 && u < self.width as f64 && v < self.height as f64
    }
}

/// An RGB8 image.
#[derive(Debug, Clone)]
pub struct RgbImage {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB triples, `3 * width * height` bytes.
    pub data: Vec<u8>,
}

impl RgbImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; (width * height * 3) as usize],
        }
    }

    pub fn pixel(&self, u: u32, v: u32) -> [u8; 3] {
        let i = ((v * self.width + u) * 3) as usize;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn set_pixel(&mut self, u: u32, v: u32, rgb: [u8; 3]) {
        let i = ((v * self.width + u) * 3) as usize;
        self.data[i..i + 3].copy_from_slice(&rgb);
    }
}

/// A depth image in meters. Zero or non-finite values mean missing depth.
#[derive(Debug, Clone)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl DepthImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width * height) as usize],
        }
    }

    pub fn at(&self, u: u32, v: u32) -> f32 {
        self.data[(v * self.width + u) as usize]
    }

    pub fn set(&mut self, u: u32, v: u32, depth: f32) {
        self.data[(v * self.width + u) as usize] = depth;
    }
}

/// An organized point cloud (row-major, same layout as the depth image).
#[derive(Debug, Clone)]
pub struct PointCloud {
    pub width: u32,
    pub height: u32,
    pub points: Vec<Option<Point3<f64>>>,
}

/// A detected 2D keypoint.
#[derive(Debug, Clone, Copy)]
pub struct Keypoint {
    pub u: f32,
    pub v: f32,
    pub response: f32,
}

/// A feature descriptor. The variant (and for floats, the length) is fixed
/// per extractor choice for the lifetime of the process.
#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    /// 256-bit binary descriptor (ORB).
    Binary([u8; 32]),
    /// Float vector descriptor (SURF).
    Float(Vec<f32>),
}

impl Descriptor {
    /// Distance between two descriptors of the same variant: Hamming bit
    /// count for binary, L2 for float. None for mismatched variants.
    pub fn distance(&self, other: &Descriptor) -> Option<f64> {
        match (self, other) {
            (Descriptor::Binary(a), Descriptor::Binary(b)) => {
                let bits: u32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x ^ y).count_ones())
                    .sum();
                Some(bits as f64)
            }
            (Descriptor::Float(a), Descriptor::Float(b)) if a.len() == b.len() => {
                let sq: f32 = a
                    .iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum();
                Some((sq as f64).sqrt())
            }
            _ => None,
        }
    }
}

/// Keypoints with their descriptors, as produced by a [`FeatureExtractor`].
#[derive(Debug, Clone, Default)]
pub struct Features {
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
}

/// A segmented plane observation in the camera frame.
#[derive(Debug, Clone)]
pub struct PlaneObservation {
    pub plane: Plane,
    /// Supporting points, as indices into the segmentation input
    /// (organized-cloud / pixel order).
    pub inliers: Vec<usize>,
    pub centroid: Point3<f64>,
    /// Boundary hull of the observed extent, camera frame.
    pub hull: Vec<Point3<f64>>,
}

/// Keypoint detector/descriptor choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum KeypointKind {
    #[default]
    Orb,
    Surf,
}

/// Plane segmentation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMethod {
    #[default]
    Organized,
    LineBased,
}

/// Input handed to a plane segmentor: either an organized cloud or a depth
/// image with intrinsics to back-project on demand.
pub enum SegmentSource<'a> {
    Cloud(&'a PointCloud),
    Depth {
        depth: &'a DepthImage,
        intrinsics: &'a Intrinsics,
    },
}

/// Keypoint detection + description capability.
pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, rgb: &RgbImage, depth: &DepthImage) -> Features;
    fn kind(&self) -> KeypointKind;
}

/// Plane segmentation capability.
pub trait PlaneSegmentor: Send + Sync {
    fn segment(&self, source: &SegmentSource<'_>) -> Vec<PlaneObservation>;
    fn method(&self) -> SegmentMethod;
}

/// A single RGB-D observation and everything derived from it.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Sensor timestamp, seconds.
    pub stamp: f64,
    /// Source sequence number.
    pub seq: u64,
    pub intrinsics: Intrinsics,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    /// 3D back-projections per keypoint; None where depth is missing.
    pub points: Vec<Option<Point3<f64>>>,
    pub planes: Vec<PlaneObservation>,
    /// Pose in the map frame. Identity until written by the tracker.
    pub pose: Transform3D,
    /// Pose established.
    pub valid: bool,
    /// Promoted into the pose graph.
    pub keyframe: bool,
}

impl Frame {
    /// Build a frame from an RGB + depth image pair.
    pub fn from_images(
        stamp: f64,
        seq: u64,
        rgb: &RgbImage,
        depth: &DepthImage,
        intrinsics: Intrinsics,
        extractor: &dyn FeatureExtractor,
        segmentor: &dyn PlaneSegmentor,
    ) -> Self {
        let features = extractor.extract(rgb, depth);
        let points = back_project_features(&features, depth, &intrinsics);
        let planes = segmentor.segment(&SegmentSource::Depth {
            depth,
            intrinsics: &intrinsics,
        });
        debug!(
            seq,
            keypoints = features.keypoints.len(),
            planes = planes.len(),
            "Frame constructed"
        );
        Self {
            stamp,
            seq,
            intrinsics,
            keypoints: features.keypoints,
            descriptors: features.descriptors,
            points,
            planes,
            pose: Transform3D::identity(),
            valid: false,
            keyframe: false,
        }
    }

    /// Build a frame from an organized point cloud. No image features are
    /// available on this path; tracking relies on planes alone.
    pub fn from_cloud(
        stamp: f64,
        seq: u64,
        cloud: &PointCloud,
        intrinsics: Intrinsics,
        segmentor: &dyn PlaneSegmentor,
    ) -> Self {
        let planes = segmentor.segment(&SegmentSource::Cloud(cloud));
        debug!(seq, planes = planes.len(), "Frame constructed from cloud");
        Self {
            stamp,
            seq,
            intrinsics,
            keypoints: Vec::new(),
            descriptors: Vec::new(),
            points: Vec::new(),
            planes,
            pose: Transform3D::identity(),
            valid: false,
            keyframe: false,
        }
    }

    /// All valid back-projected keypoints, camera frame.
    pub fn feature_cloud(&self) -> Vec<Point3<f64>> {
        self.points.iter().filter_map(|p| *p).collect()
    }

    /// Number of keypoints with valid depth.
    pub fn valid_point_count(&self) -> usize {
        self.points.iter().filter(|p| p.is_some()).count()
    }
}

fn back_project_features(
    features: &Features,
    depth: &DepthImage,
    intrinsics: &Intrinsics,
) -> Vec<Option<Point3<f64>>> {
    features
        .keypoints
        .iter()
        .map(|kp| {
            let u = kp.u.round() as i64;
            let v = kp.v.round() as i64;
            if u < 0 || v < 0 || u >= depth.width as i64 || v >= depth.height as i64 {
                return None;
            }
            let d = depth.at(u as u32, v as u32) as f64;
            intrinsics.back_project(kp.u as f64, kp.v as f64, d)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn test_intrinsics() -> Intrinsics {
        Intrinsics {
            fx: 525.0,
            fy: 525.0,
            cx: 319.5,
            cy: 239.5,
            width: 640,
            height: 480,
            depth_scale: 1.0,
        }
    }

    #[test]
    fn back_projection_reprojects_within_a_pixel() {
        let intr = test_intrinsics();
        for (u, v, d) in [(10.0, 20.0, 0.8), (320.0, 240.0, 2.5), (600.0, 400.0, 4.0)] {
            let p = intr.back_project(u, v, d).unwrap();
            let (u2, v2) = intr.project(&p).unwrap();
            assert!((u - u2).abs() < 1.0);
            assert!((v - v2).abs() < 1.0);
        }
    }

    #[test]
    fn invalid_depth_is_rejected() {
        let intr = test_intrinsics();
        assert!(intr.back_project(10.0, 10.0, 0.0).is_none());
        assert!(intr.back_project(10.0, 10.0, f64::NAN).is_none());
        assert!(intr.back_project(10.0, 10.0, -1.0).is_none());
    }

    #[test]
    fn behind_camera_does_not_project() {
        let intr = test_intrinsics();
        assert!(intr.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(intr.project(&Point3::new(0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn binary_descriptor_distance() {
        let a = Descriptor::Binary([0u8; 32]);
        let mut bytes = [0u8; 32];
        bytes[0] = 0xFF;
        bytes[31] = 0x0F;
        let b = Descriptor::Binary(bytes);
        assert_relative_eq!(a.distance(&b).unwrap(), 12.0);
        assert_relative_eq!(a.distance(&a).unwrap(), 0.0);
    }

    #[test]
    fn float_descriptor_distance() {
        let a = Descriptor::Float(vec![0.0, 3.0]);
        let b = Descriptor::Float(vec![4.0, 0.0]);
        assert_relative_eq!(a.distance(&b).unwrap(), 5.0, epsilon = 1e-6);
        assert!(a.distance(&Descriptor::Binary([0; 32])).is_none());
    }

    #[test]
    fn features_outside_depth_bounds_get_no_point() {
        let intr = test_intrinsics();
        let mut depth = DepthImage::new(640, 480);
        depth.set(100, 100, 2.0);
        let features = Features {
            keypoints: vec![
                Keypoint { u: 100.0, v: 100.0, response: 1.0 },
                Keypoint { u: 5000.0, v: 100.0, response: 1.0 },
                Keypoint { u: 50.0, v: 50.0, response: 1.0 }, // zero depth
            ],
            descriptors: vec![Descriptor::Binary([0; 32]); 3],
        };
        let points = back_project_features(&features, &depth, &intr);
        assert!(points[0].is_some());
        assert!(points[1].is_none());
        assert!(points[2].is_none());
        assert_relative_eq!(points[0].unwrap().z, 2.0, epsilon = 1e-9);
    }
}

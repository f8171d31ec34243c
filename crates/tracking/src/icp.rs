//! Iterative closest point on the keypoint 3D clouds.

use crate::solvers::{solve_rt_points, MotionEstimate};
use geometry::Transform3D;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IcpConfig {
    /// Correspondences farther than this are ignored (meters).
    pub max_correspondence_distance: f64,
    pub iterations: usize,
    /// Convergence threshold on the per-iteration transform change.
    pub tf_epsilon: f64,
    /// Maximum mean squared correspondence distance for a valid result.
    pub score_threshold: f64,
}

impl Default for IcpConfig {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.5,
            iterations: 50,
            tf_epsilon: 1e-6,
            score_threshold: 0.05,
        }
    }
}

/// Align `source` onto `target`, returning the transform that maps source
/// coordinates into the target frame.
pub fn align(source: &[Point3<f64>], target: &[Point3<f64>], cfg: &IcpConfig) -> MotionEstimate {
    if source.len() < 3 || target.len() < 3 {
        return MotionEstimate::invalid();
    }

    let mut current = Transform3D::identity();
    for _ in 0..cfg.iterations {
        let Some((from, to, _)) = correspondences(source, target, &current, cfg) else {
            return MotionEstimate::invalid();
        };
        let est = solve_rt_points(&from, &to);
        if !est.valid || !est.is_finite() {
            return MotionEstimate::invalid();
        }
        let next = est.to_transform();
        let delta = current.relative_to(&next);
        current = next;
        if delta.translation().norm() < cfg.tf_epsilon && delta.rotation_angle() < cfg.tf_epsilon {
            break;
        }
    }

    let Some((from, _, fitness)) = correspondences(source, target, &current, cfg) else {
        return MotionEstimate::invalid();
    };
    let mut result = MotionEstimate::from_transform(&current, from.len(), fitness.sqrt());
    result.valid = fitness <= cfg.score_threshold;
    result
}

/// Nearest-neighbor correspondences of the transformed source within the
/// distance gate, plus the mean squared distance (fitness).
fn correspondences(
    source: &[Point3<f64>],
    target: &[Point3<f64>],
    transform: &Transform3D,
    cfg: &IcpConfig,
) -> Option<(Vec<Point3<f64>>, Vec<Point3<f64>>, f64)> {
    let max_sq = cfg.max_correspondence_distance * cfg.max_correspondence_distance;
    let mut from = Vec::new();
    let mut to = Vec::new();
    let mut sq_sum = 0.0;
    for s in source {
        let sp = transform.transform_point(s);
        let mut best = f64::MAX;
        let mut best_idx = 0;
        for (j, t) in target.iter().enumerate() {
            let d2 = (t - sp).norm_squared();
            if d2 < best {
                best = d2;
                best_idx = j;
            }
        }
        if best <= max_sq {
            from.push(*s);
            to.push(target[best_idx]);
            sq_sum += best;
        }
    }
    if from.len() < 3 {
        return None;
    }
    let fitness = sq_sum / from.len() as f64;
    Some((from, to, fitness))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid_cloud() -> Vec<Point3<f64>> {
        let mut cloud = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                cloud.push(Point3::new(
                    0.3 * i as f64,
                    0.25 * j as f64,
                    2.0 + 0.1 * ((i * j) % 3) as f64,
                ));
            }
        }
        cloud
    }

    #[test]
    fn identity_alignment() {
        let cloud = grid_cloud();
        let est = align(&cloud, &cloud, &IcpConfig::default());
        assert!(est.valid);
        assert!(est.translation.norm() < 1e-9);
        assert_relative_eq!(est.rmse, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn small_motion_recovered() {
        let target = grid_cloud();
        let t = Transform3D::from_xyz_rpy(0.03, -0.02, 0.01, 0.0, 0.0, 0.02);
        // source observed in the "current" frame: p_cur = T^-1 * p_last
        let inv = t.inverse();
        let source: Vec<_> = target.iter().map(|p| inv.transform_point(p)).collect();
        let est = align(&source, &target, &IcpConfig::default());
        assert!(est.valid);
        let diff = est.to_transform().relative_to(&t);
        assert!(diff.translation().norm() < 1e-6);
        assert!(diff.rotation_angle() < 1e-6);
    }

    #[test]
    fn too_few_points_invalid() {
        let cloud = vec![Point3::new(0.0, 0.0, 1.0)];
        assert!(!align(&cloud, &cloud, &IcpConfig::default()).valid);
    }
}

//! RANSAC perspective-n-point: 3D points of the current frame against 2D
//! observations of the last frame.

use crate::solvers::MotionEstimate;
use frame::Intrinsics;
use geometry::Transform3D;
use nalgebra::{
    Isometry3, Matrix2x3, Matrix2x6, Matrix3, Matrix6, Point3, Translation3, UnitQuaternion,
    Vector2, Vector3, Vector6,
};
use rand::{rngs::StdRng, Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PnpConfig {
    pub iterations: usize,
    /// Maximum reprojection error for an inlier, pixels.
    pub reprojection_error_px: f64,
    pub min_inlier: usize,
}

impl Default for PnpConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            reprojection_error_px: 3.0,
            min_inlier: 25,
        }
    }
}

/// Solve for the transform projecting `points` (current camera frame) onto
/// `pixels` (last frame observations): the result maps current-frame
/// coordinates into the last camera frame.
pub fn solve_ransac(
    points: &[Point3<f64>],
    pixels: &[(f64, f64)],
    intrinsics: &Intrinsics,
    initial: &Transform3D,
    cfg: &PnpConfig,
    rng: &mut StdRng,
) -> MotionEstimate {
    let n = points.len();
    if n < 4 || n != pixels.len() {
        return MotionEstimate::invalid();
    }
    let min_inlier = cfg.min_inlier.min((0.75 * n as f64) as usize).max(4);

    let mut best_pose: Option<Isometry3<f64>> = None;
    let mut best_inliers: Vec<usize> = Vec::new();

    for _ in 0..cfg.iterations {
        let mut ids = BTreeSet::new();
        while ids.len() < 4 {
            ids.insert(rng.gen_range(0..n));
        }
        let sample: Vec<usize> = ids.into_iter().collect();
        let Some(pose) = refine(points, pixels, &sample, *initial.as_isometry(), intrinsics)
        else {
            continue;
        };
        let inliers = select_inliers(points, pixels, &pose, intrinsics, cfg.reprojection_error_px);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_pose = Some(pose);
            if best_inliers.len() as f64 > 0.9 * n as f64 {
                break;
            }
        }
    }

    let Some(pose) = best_pose else {
        return MotionEstimate::invalid();
    };
    if best_inliers.len() < 4 {
        return MotionEstimate::invalid();
    }

    // Final refinement over the consensus set.
    let refined = refine(points, pixels, &best_inliers, pose, intrinsics).unwrap_or(pose);
    let inliers = select_inliers(points, pixels, &refined, intrinsics, cfg.reprojection_error_px);
    let (inliers, pose) = if inliers.len() >= best_inliers.len() {
        (inliers, refined)
    } else {
        (best_inliers, pose)
    };

    let mut sq = 0.0;
    for &i in &inliers {
        if let Some(e) = reprojection_error(&pose, &points[i], pixels[i], intrinsics) {
            sq += e * e;
        }
    }
    let rmse = (sq / inliers.len() as f64).sqrt();

    let mut result = MotionEstimate {
        rotation: UnitQuaternion::from_rotation_matrix(&pose.rotation.to_rotation_matrix()),
        translation: pose.translation.vector,
        inliers: inliers.len(),
        rmse,
        valid: inliers.len() >= min_inlier,
    };
    if !result.is_finite() {
        result = MotionEstimate::invalid();
    }
    result
}

fn reprojection_error(
    pose: &Isometry3<f64>,
    point: &Point3<f64>,
    pixel: (f64, f64),
    intr: &Intrinsics,
) -> Option<f64> {
    let xc = pose.transform_point(point);
    if xc.z <= 1e-6 {
        return None;
    }
    let u = intr.fx * xc.x / xc.z + intr.cx;
    let v = intr.fy * xc.y / xc.z + intr.cy;
    Some(((u - pixel.0).powi(2) + (v - pixel.1).powi(2)).sqrt())
}

fn select_inliers(
    points: &[Point3<f64>],
    pixels: &[(f64, f64)],
    pose: &Isometry3<f64>,
    intr: &Intrinsics,
    max_err: f64,
) -> Vec<usize> {
    (0..points.len())
        .filter(|&i| {
            reprojection_error(pose, &points[i], pixels[i], intr)
                .map_or(false, |e| e < max_err)
        })
        .collect()
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Gauss-Newton pose refinement minimizing the reprojection error over the
/// given index set, left-multiplicative se(3) updates.
fn refine(
    points: &[Point3<f64>],
    pixels: &[(f64, f64)],
    indices: &[usize],
    init: Isometry3<f64>,
    intr: &Intrinsics,
) -> Option<Isometry3<f64>> {
    let mut pose = init;
    for _ in 0..10 {
        let mut h = Matrix6::zeros();
        let mut g = Vector6::zeros();
        let mut used = 0;
        for &i in indices {
            let xc = pose.transform_point(&points[i]);
            if xc.z <= 1e-6 {
                continue;
            }
            let z_inv = 1.0 / xc.z;
            let u = intr.fx * xc.x * z_inv + intr.cx;
            let v = intr.fy * xc.y * z_inv + intr.cy;
            let r = Vector2::new(u - pixels[i].0, v - pixels[i].1);

            let j_cam = Matrix2x3::new(
                intr.fx * z_inv,
                0.0,
                -intr.fx * xc.x * z_inv * z_inv,
                0.0,
                intr.fy * z_inv,
                -intr.fy * xc.y * z_inv * z_inv,
            );
            let mut j = Matrix2x6::zeros();
            j.fixed_view_mut::<2, 3>(0, 0).copy_from(&j_cam);
            j.fixed_view_mut::<2, 3>(0, 3)
                .copy_from(&(j_cam * (-skew(&xc.coords))));

            h += j.transpose() * j;
            g += j.transpose() * r;
            used += 1;
        }
        if used < 3 {
            return None;
        }
        let damped = h + Matrix6::identity() * 1e-9;
        let dx = damped.lu().solve(&(-g))?;
        if !dx.iter().all(|x| x.is_finite()) {
            return None;
        }

        let dv = Vector3::new(dx[0], dx[1], dx[2]);
        let dw = Vector3::new(dx[3], dx[4], dx[5]);
        let dr = UnitQuaternion::from_scaled_axis(dw);
        let rotation = dr * pose.rotation;
        let translation = dr * pose.translation.vector + dv;
        pose = Isometry3::from_parts(Translation3::from(translation), rotation);

        if dx.norm() < 1e-10 {
            break;
        }
    }
    Some(pose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

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

    fn scene() -> Vec<Point3<f64>> {
        let mut points = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                points.push(Point3::new(
                    -0.6 + 0.25 * i as f64,
                    -0.4 + 0.2 * j as f64,
                    1.8 + 0.15 * ((i + j) % 4) as f64,
                ));
            }
        }
        points
    }

    #[test]
    fn recovers_known_motion() {
        let intr = test_intrinsics();
        let motion = Transform3D::from_xyz_rpy(0.04, -0.02, 0.03, 0.01, -0.02, 0.03);
        // Points in the current frame; pixels observed by the last camera.
        let points = scene();
        let pixels: Vec<_> = points
            .iter()
            .map(|p| {
                let in_last = motion.transform_point(p);
                intr.project(&in_last).unwrap()
            })
            .collect();

        let mut rng = StdRng::seed_from_u64(7);
        let cfg = PnpConfig {
            min_inlier: 20,
            ..Default::default()
        };
        let est = solve_ransac(
            &points,
            &pixels,
            &intr,
            &Transform3D::identity(),
            &cfg,
            &mut rng,
        );
        assert!(est.valid);
        let diff = est.to_transform().relative_to(&motion);
        assert!(diff.translation().norm() < 1e-4);
        assert!(diff.rotation_angle() < 1e-4);
    }

    #[test]
    fn outliers_are_rejected() {
        let intr = test_intrinsics();
        let motion = Transform3D::from_xyz_rpy(0.02, 0.0, 0.01, 0.0, 0.0, 0.015);
        let points = scene();
        let mut pixels: Vec<_> = points
            .iter()
            .map(|p| intr.project(&motion.transform_point(p)).unwrap())
            .collect();
        // Corrupt a fifth of the observations.
        for i in (0..pixels.len()).step_by(5) {
            pixels[i].0 += 60.0;
            pixels[i].1 -= 45.0;
        }

        let mut rng = StdRng::seed_from_u64(11);
        let cfg = PnpConfig {
            min_inlier: 20,
            ..Default::default()
        };
        let est = solve_ransac(
            &points,
            &pixels,
            &intr,
            &Transform3D::identity(),
            &cfg,
            &mut rng,
        );
        assert!(est.valid);
        assert!(est.inliers >= 20);
        let diff = est.to_transform().relative_to(&motion);
        assert!(diff.translation().norm() < 1e-3);
    }

    #[test]
    fn too_few_points_invalid() {
        let intr = test_intrinsics();
        let mut rng = StdRng::seed_from_u64(3);
        let est = solve_ransac(
            &[Point3::new(0.0, 0.0, 1.0)],
            &[(320.0, 240.0)],
            &intr,
            &Transform3D::identity(),
            &PnpConfig::default(),
            &mut rng,
        );
        assert!(!est.valid);
    }
}

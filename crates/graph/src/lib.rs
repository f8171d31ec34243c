//! Incremental pose-graph back-end.
//!
//! Keyframe poses are 6-DoF nodes; factors are between-pose constraints from
//! the tracker, plane-landmark observations (normal + distance) and 3D point
//! observations. Each keyframe insertion triggers an incremental update: a
//! warm-started damped Gauss-Newton pass over the pose variables followed by
//! a landmark re-estimation sweep, instead of a full batch solve.

use geometry::{Plane, Transform3D};
use nalgebra::{DMatrix, DVector, Point3, SMatrix, SVector, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{self, Write};
use thiserror::Error;
use tracing::{debug, warn};
use types::{KeyframeId, LandmarkId};

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("linear solve failed during incremental update")]
    SolveFailed,
    #[error("non-finite update in incremental optimization")]
    NonFinite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    pub damping: f64,
    /// Large diagonal weight pinning the first pose (gauge freedom).
    pub gauge_weight: f64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            convergence_threshold: 1e-4,
            damping: 1e-3,
            gauge_weight: 1e10,
        }
    }
}

/// A constraint in the pose graph.
#[derive(Debug, Clone)]
pub enum Factor {
    Between {
        from: KeyframeId,
        to: KeyframeId,
        /// Relative pose measurement, from -> to.
        measurement: Transform3D,
        weight: f64,
    },
    PlaneObs {
        pose: KeyframeId,
        landmark: LandmarkId,
        /// Plane observed in the keyframe's camera frame.
        observed: Plane,
        weight: f64,
    },
    PointObs {
        pose: KeyframeId,
        landmark: LandmarkId,
        /// Point observed in the keyframe's camera frame.
        observed: Point3<f64>,
        weight: f64,
    },
}

/// Landmark observations attached to a keyframe at insertion.
#[derive(Debug, Clone, Default)]
pub struct KeyframeObservations {
    /// (landmark, plane in camera frame)
    pub planes: Vec<(LandmarkId, Plane)>,
    /// (landmark, point in camera frame)
    pub points: Vec<(LandmarkId, Point3<f64>)>,
}

/// Result of a keyframe insertion.
#[derive(Debug, Clone, Copy)]
pub struct KeyframeInsertion {
    pub id: KeyframeId,
    /// The incremental update failed numerically; estimates were kept from
    /// before the update and the keyframe should be treated as provisional.
    pub provisional: bool,
}

pub struct PoseGraph {
    config: GraphConfig,
    poses: Vec<Transform3D>,
    plane_landmarks: BTreeMap<LandmarkId, Plane>,
    point_landmarks: BTreeMap<LandmarkId, Point3<f64>>,
    factors: Vec<Factor>,
}

impl PoseGraph {
    pub fn new(config: GraphConfig) -> Self {
        Self {
            config,
            poses: Vec::new(),
            plane_landmarks: BTreeMap::new(),
            point_landmarks: BTreeMap::new(),
            factors: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Append a keyframe node with its factors and run the incremental
    /// update. Pose ids are strictly monotonic.
    pub fn insert_keyframe(
        &mut self,
        pose_prior: Transform3D,
        between: Option<(KeyframeId, Transform3D, f64)>,
        observations: &KeyframeObservations,
    ) -> KeyframeInsertion {
        let id = KeyframeId(self.poses.len() as u64);
        self.poses.push(pose_prior);

        if let Some((from, measurement, weight)) = between {
            self.factors.push(Factor::Between {
                from,
                to: id,
                measurement,
                weight,
            });
        }
        for (lm, observed) in &observations.planes {
            self.plane_landmarks
                .entry(*lm)
                .or_insert_with(|| observed.transformed(&pose_prior));
            self.factors.push(Factor::PlaneObs {
                pose: id,
                landmark: *lm,
                observed: *observed,
                weight: 1.0,
            });
        }
        for (lm, observed) in &observations.points {
            self.point_landmarks
                .entry(*lm)
                .or_insert_with(|| pose_prior.transform_point(observed));
            self.factors.push(Factor::PointObs {
                pose: id,
                landmark: *lm,
                observed: *observed,
                weight: 1.0,
            });
        }

        let poses_snapshot = self.poses.clone();
        let planes_snapshot = self.plane_landmarks.clone();
        let points_snapshot = self.point_landmarks.clone();

        match self.optimize() {
            Ok(()) => KeyframeInsertion {
                id,
                provisional: false,
            },
            Err(e) => {
                warn!(?e, %id, "incremental update failed, keeping previous estimates");
                self.poses = poses_snapshot;
                self.plane_landmarks = planes_snapshot;
                self.point_landmarks = points_snapshot;
                KeyframeInsertion {
                    id,
                    provisional: true,
                }
            }
        }
    }

    pub fn optimized_pose(&self, id: KeyframeId) -> Option<Transform3D> {
        self.poses.get(id.0 as usize).copied()
    }

    pub fn optimized_path(&self) -> &[Transform3D] {
        &self.poses
    }

    pub fn plane_landmarks(&self) -> &BTreeMap<LandmarkId, Plane> {
        &self.plane_landmarks
    }

    pub fn point_landmarks(&self) -> &BTreeMap<LandmarkId, Point3<f64>> {
        &self.point_landmarks
    }

    pub fn factors(&self) -> &[Factor] {
        &self.factors
    }

    /// Warm-started damped Gauss-Newton over the pose variables, then a
    /// landmark re-estimation sweep from the optimized poses.
    fn optimize(&mut self) -> Result<(), GraphError> {
        if self.poses.len() >= 2 {
            for iteration in 0..self.config.max_iterations {
                let (mut h, b) = self.build_linear_system();

                let n = h.nrows();
                for i in 0..n {
                    h[(i, i)] += self.config.damping;
                }
                // Pin the first pose (gauge freedom).
                for i in 0..6 {
                    h[(i, i)] += self.config.gauge_weight;
                }

                let dx = h.lu().solve(&(-&b)).ok_or(GraphError::SolveFailed)?;
                if !dx.iter().all(|v| v.is_finite()) {
                    return Err(GraphError::NonFinite);
                }
                if dx.norm() < self.config.convergence_threshold {
                    debug!(iterations = iteration + 1, "pose graph converged");
                    break;
                }
                self.apply_update(&dx);
            }
        }
        self.reestimate_landmarks();
        Ok(())
    }

    fn build_linear_system(&self) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.poses.len() * 6;
        let mut h = DMatrix::zeros(n, n);
        let mut b = DVector::zeros(n);

        for factor in &self.factors {
            match factor {
                Factor::Between {
                    from,
                    to,
                    measurement,
                    weight,
                } => {
                    let i = from.0 as usize * 6;
                    let j = to.0 as usize * 6;
                    let predicted =
                        self.poses[from.0 as usize].relative_to(&self.poses[to.0 as usize]);
                    let r = se3_residual(measurement, &predicted);
                    // Simplified Jacobians, exact for small errors:
                    // J_from = -I, J_to = I.
                    for k in 0..6 {
                        h[(i + k, i + k)] += weight;
                        h[(j + k, j + k)] += weight;
                        h[(i + k, j + k)] -= weight;
                        h[(j + k, i + k)] -= weight;
                        b[i + k] -= weight * r[k];
                        b[j + k] += weight * r[k];
                    }
                }
                Factor::PlaneObs {
                    pose,
                    landmark,
                    observed,
                    weight,
                } => {
                    let Some(lm) = self.plane_landmarks.get(landmark) else {
                        continue;
                    };
                    let k = pose.0 as usize * 6;
                    let p = &self.poses[pose.0 as usize];
                    let r = plane_residual(p, lm, observed);
                    let j = numeric_jacobian(p, |q| plane_residual(q, lm, observed));
                    accumulate_block::<4>(&mut h, &mut b, k, &j, &r, *weight);
                }
                Factor::PointObs {
                    pose,
                    landmark,
                    observed,
                    weight,
                } => {
                    let Some(lm) = self.point_landmarks.get(landmark) else {
                        continue;
                    };
                    let k = pose.0 as usize * 6;
                    let p = &self.poses[pose.0 as usize];
                    let r = point_residual(p, lm, observed);
                    let j = numeric_jacobian(p, |q| point_residual(q, lm, observed));
                    accumulate_block::<3>(&mut h, &mut b, k, &j, &r, *weight);
                }
            }
        }
        (h, b)
    }

    fn apply_update(&mut self, dx: &DVector<f64>) {
        for (i, pose) in self.poses.iter_mut().enumerate() {
            let k = i * 6;
            let v = Vector3::new(dx[k], dx[k + 1], dx[k + 2]);
            let w = Vector3::new(dx[k + 3], dx[k + 4], dx[k + 5]);
            let delta = Transform3D::new(v, UnitQuaternion::from_scaled_axis(w));
            *pose = *pose * delta;
        }
    }

    /// Re-estimate landmarks as the mean of their observations transformed
    /// through the current pose estimates.
    fn reestimate_landmarks(&mut self) {
        let mut plane_acc: BTreeMap<LandmarkId, ([f64; 4], f64)> = BTreeMap::new();
        let mut point_acc: BTreeMap<LandmarkId, (Vector3<f64>, f64)> = BTreeMap::new();

        for factor in &self.factors {
            match factor {
                Factor::PlaneObs {
                    pose,
                    landmark,
                    observed,
                    weight,
                } => {
                    let in_map = observed.transformed(&self.poses[pose.0 as usize]);
                    let c = in_map.coefficients();
                    let entry = plane_acc.entry(*landmark).or_insert(([0.0; 4], 0.0));
                    for (acc, v) in entry.0.iter_mut().zip(c.iter()) {
                        *acc += weight * v;
                    }
                    entry.1 += weight;
                }
                Factor::PointObs {
                    pose,
                    landmark,
                    observed,
                    weight,
                } => {
                    let in_map = self.poses[pose.0 as usize].transform_point(observed);
                    let entry = point_acc
                        .entry(*landmark)
                        .or_insert((Vector3::zeros(), 0.0));
                    entry.0 += *weight * in_map.coords;
                    entry.1 += weight;
                }
                Factor::Between { .. } => {}
            }
        }

        for (id, (c, w)) in plane_acc {
            if w > 0.0 {
                self.plane_landmarks.insert(
                    id,
                    Plane::from_coefficients(c[0] / w, c[1] / w, c[2] / w, c[3] / w),
                );
            }
        }
        for (id, (p, w)) in point_acc {
            if w > 0.0 {
                self.point_landmarks.insert(id, Point3::from(p / w));
            }
        }
    }

    /// Dump the graph as Graphviz DOT: pose nodes, landmark nodes, factor
    /// edges.
    pub fn save_dot<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "graph slam {{")?;
        for i in 0..self.poses.len() {
            let t = self.poses[i].translation();
            writeln!(
                w,
                "  x{} [label=\"x{}\\n({:.2}, {:.2}, {:.2})\"];",
                i, i, t.x, t.y, t.z
            )?;
        }
        for id in self.plane_landmarks.keys() {
            writeln!(w, "  {} [shape=box];", id)?;
        }
        for id in self.point_landmarks.keys() {
            writeln!(w, "  {} [shape=point];", id)?;
        }
        for factor in &self.factors {
            match factor {
                Factor::Between { from, to, .. } => {
                    writeln!(w, "  {} -- {};", from, to)?;
                }
                Factor::PlaneObs { pose, landmark, .. }
                | Factor::PointObs { pose, landmark, .. } => {
                    writeln!(w, "  {} -- {};", pose, landmark)?;
                }
            }
        }
        writeln!(w, "}}")
    }
}

/// Residual of a between factor: log of the composition error, packed as
/// (translation, rotation vector).
fn se3_residual(measurement: &Transform3D, predicted: &Transform3D) -> SVector<f64, 6> {
    let e = measurement.relative_to(predicted);
    let t = e.translation();
    let r = e.rotation().scaled_axis();
    SVector::<f64, 6>::from_column_slice(&[t.x, t.y, t.z, r.x, r.y, r.z])
}

/// Residual of a plane observation: coefficient difference between the
/// landmark predicted into the camera frame and the observation.
fn plane_residual(pose: &Transform3D, landmark: &Plane, observed: &Plane) -> SVector<f64, 4> {
    let predicted = landmark.transformed(&pose.inverse());
    let p = predicted.coefficients();
    let o = observed.coefficients();
    SVector::<f64, 4>::from_column_slice(&[p[0] - o[0], p[1] - o[1], p[2] - o[2], p[3] - o[3]])
}

/// Residual of a point observation in the camera frame.
fn point_residual(
    pose: &Transform3D,
    landmark: &Point3<f64>,
    observed: &Point3<f64>,
) -> SVector<f64, 3> {
    let predicted = pose.inverse().transform_point(landmark);
    predicted - observed
}

/// Central-difference Jacobian of a residual with respect to a
/// right-multiplicative pose perturbation.
fn numeric_jacobian<const R: usize>(
    pose: &Transform3D,
    residual: impl Fn(&Transform3D) -> SVector<f64, R>,
) -> SMatrix<f64, R, 6> {
    let eps = 1e-6;
    let mut j = SMatrix::<f64, R, 6>::zeros();
    for d in 0..6 {
        let plus = residual(&perturbed(pose, d, eps));
        let minus = residual(&perturbed(pose, d, -eps));
        let col = (plus - minus) / (2.0 * eps);
        j.set_column(d, &col);
    }
    j
}

fn perturbed(pose: &Transform3D, dim: usize, eps: f64) -> Transform3D {
    let mut v = Vector3::zeros();
    let mut w = Vector3::zeros();
    if dim < 3 {
        v[dim] = eps;
    } else {
        w[dim - 3] = eps;
    }
    *pose * Transform3D::new(v, UnitQuaternion::from_scaled_axis(w))
}

/// Accumulate a single-block landmark factor into the system:
/// H_kk += J^T W J, b_k += J^T W r.
fn accumulate_block<const R: usize>(
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    k: usize,
    j: &SMatrix<f64, R, 6>,
    r: &SVector<f64, R>,
    weight: f64,
) {
    let jtj = j.transpose() * j * weight;
    let jtr = j.transpose() * r * weight;
    for row in 0..6 {
        for col in 0..6 {
            h[(k + row, k + col)] += jtj[(row, col)];
        }
        b[k + row] += jtr[row];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn room_observations(pose: &Transform3D) -> KeyframeObservations {
        let cam_from_map = pose.inverse();
        let planes = [
            Plane::from_coefficients(0.0, 0.0, 1.0, -3.0),
            Plane::from_coefficients(1.0, 0.0, 0.0, 2.0),
            Plane::from_coefficients(0.0, 1.0, 0.0, 1.5),
        ];
        let points = [
            Point3::new(0.3, -0.2, 2.0),
            Point3::new(-0.4, 0.1, 2.5),
            Point3::new(0.6, 0.4, 1.8),
        ];
        KeyframeObservations {
            planes: planes
                .iter()
                .enumerate()
                .map(|(i, p)| (LandmarkId(i as u64), p.transformed(&cam_from_map)))
                .collect(),
            points: points
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    (
                        LandmarkId(100 + i as u64),
                        cam_from_map.transform_point(p),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn single_keyframe_initializes_landmarks() {
        let mut g = PoseGraph::new(GraphConfig::default());
        let res = g.insert_keyframe(
            Transform3D::identity(),
            None,
            &room_observations(&Transform3D::identity()),
        );
        assert!(!res.provisional);
        assert_eq!(res.id, KeyframeId(0));
        assert_eq!(g.plane_landmarks().len(), 3);
        assert_eq!(g.point_landmarks().len(), 3);
        let lm = g.plane_landmarks()[&LandmarkId(0)];
        assert_relative_eq!(lm.d(), 3.0, epsilon = 1e-9);
    }

    #[test]
    fn between_factor_corrects_bad_prior() {
        let mut g = PoseGraph::new(GraphConfig::default());
        g.insert_keyframe(
            Transform3D::identity(),
            None,
            &room_observations(&Transform3D::identity()),
        );

        let truth = Transform3D::from_xyz_rpy(0.2, 0.0, 0.05, 0.0, 0.0, 0.05);
        // Prior is off; the between measurement and landmark factors agree
        // on the truth.
        let prior = Transform3D::from_xyz_rpy(0.26, 0.03, 0.05, 0.0, 0.0, 0.08);
        let res = g.insert_keyframe(
            prior,
            Some((KeyframeId(0), truth, 100.0)),
            &room_observations(&truth),
        );
        assert!(!res.provisional);

        let optimized = g.optimized_pose(res.id).unwrap();
        let diff = optimized.relative_to(&truth);
        assert!(diff.translation().norm() < 0.01, "residual translation {}", diff.translation().norm());
        assert!(diff.rotation_angle() < 0.01);
    }

    #[test]
    fn chain_stays_consistent() {
        let mut g = PoseGraph::new(GraphConfig::default());
        let mut truth = Transform3D::identity();
        g.insert_keyframe(truth, None, &room_observations(&truth));
        let step = Transform3D::from_xyz_rpy(0.1, 0.0, 0.0, 0.0, 0.0, 0.02);
        let mut prev = KeyframeId(0);
        for _ in 0..5 {
            truth = truth * step;
            let res = g.insert_keyframe(
                truth,
                Some((prev, step, 100.0)),
                &room_observations(&truth),
            );
            assert!(!res.provisional);
            prev = res.id;
        }
        assert_eq!(g.len(), 6);
        let last = g.optimized_pose(prev).unwrap();
        let diff = last.relative_to(&truth);
        assert!(diff.translation().norm() < 1e-3);
        assert!(diff.rotation_angle() < 1e-3);
    }

    #[test]
    fn dot_dump_lists_nodes_and_edges() {
        let mut g = PoseGraph::new(GraphConfig::default());
        g.insert_keyframe(
            Transform3D::identity(),
            None,
            &room_observations(&Transform3D::identity()),
        );
        let truth = Transform3D::from_xyz_rpy(0.1, 0.0, 0.0, 0.0, 0.0, 0.0);
        g.insert_keyframe(
            truth,
            Some((KeyframeId(0), truth, 10.0)),
            &room_observations(&truth),
        );

        let mut buf = Vec::new();
        g.save_dot(&mut buf).unwrap();
        let dot = String::from_utf8(buf).unwrap();
        assert!(dot.starts_with("graph slam {"));
        assert!(dot.contains("x0"));
        assert!(dot.contains("x0 -- x1;"));
        assert!(dot.contains("l0 [shape=box];"));
        assert!(dot.contains("x1 -- l100;"));
    }

    #[test]
    fn monotonic_pose_ids() {
        let mut g = PoseGraph::new(GraphConfig::default());
        for i in 0..4 {
            let res = g.insert_keyframe(
                Transform3D::identity(),
                None,
                &KeyframeObservations::default(),
            );
            assert_eq!(res.id, KeyframeId(i));
        }
    }
}

//! Data association: project known landmarks into a candidate frame under a
//! pose and find correspondences.

use crate::LandmarkStore;
use frame::Frame;
use geometry::Transform3D;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;
use types::LandmarkId;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Maximum normal angle between an observed plane and a landmark (radians).
    pub dir_threshold_rad: f64,
    /// Maximum point-to-plane distance of the observed centroid (meters).
    pub dis_threshold_m: f64,
    /// Pixel radius around a projected point landmark to search keypoints.
    pub point_gate_px: f64,
    /// Point landmarks beyond this camera depth are not associated (meters).
    pub point_depth_gate_m: f64,
    /// Maximum descriptor distance for a keypoint association
    /// (Hamming bits for binary descriptors, L2 for float).
    pub descriptor_threshold: f64,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            dir_threshold_rad: 15.0_f64.to_radians(),
            dis_threshold_m: 0.1,
            point_gate_px: 30.0,
            point_depth_gate_m: 8.0,
            descriptor_threshold: 64.0,
        }
    }
}

/// A plane observation matched to a plane landmark.
#[derive(Debug, Clone, Copy)]
pub struct PlaneMatch {
    /// Index into the frame's plane observations.
    pub observation: usize,
    pub landmark: LandmarkId,
    pub angle: f64,
    pub distance: f64,
}

/// A keypoint matched to a point landmark.
#[derive(Debug, Clone, Copy)]
pub struct PointMatch {
    /// Index into the frame's keypoints.
    pub keypoint: usize,
    pub landmark: LandmarkId,
    pub distance: f64,
}

#[derive(Debug, Default)]
pub struct Associations {
    pub plane_matches: Vec<PlaneMatch>,
    /// Frame plane indices with no landmark counterpart.
    pub unmatched_planes: Vec<usize>,
    pub point_matches: Vec<PointMatch>,
    /// Keypoint indices (with valid depth) that matched no landmark.
    pub unmatched_points: Vec<usize>,
    /// Landmarks that should have been visible but found no match.
    pub missed_points: Vec<LandmarkId>,
}

impl Associations {
    pub fn unmatched_count(&self) -> usize {
        self.unmatched_planes.len() + self.unmatched_points.len()
    }
}

/// Associate the frame's observations with the landmark store under the
/// candidate pose (map frame).
pub fn associate(
    store: &LandmarkStore,
    frame: &Frame,
    pose: &Transform3D,
    cfg: &AssociationConfig,
) -> Associations {
    let mut out = Associations::default();
    associate_planes(store, frame, pose, cfg, &mut out);
    associate_points(store, frame, pose, cfg, &mut out);
    debug!(
        plane_matches = out.plane_matches.len(),
        point_matches = out.point_matches.len(),
        unmatched = out.unmatched_count(),
        "data association"
    );
    out
}

fn associate_planes(
    store: &LandmarkStore,
    frame: &Frame,
    pose: &Transform3D,
    cfg: &AssociationConfig,
    out: &mut Associations,
) {
    let mut candidates: Vec<PlaneMatch> = Vec::new();
    for (i, obs) in frame.planes.iter().enumerate() {
        let observed = obs.plane.transformed(pose);
        let centroid = pose.transform_point(&obs.centroid);
        let mut best: Option<PlaneMatch> = None;
        for lm in store.valid_planes() {
            let angle = observed.angle_to(&lm.plane);
            let distance = lm.plane.distance_to_point(&centroid);
            if angle > cfg.dir_threshold_rad || distance > cfg.dis_threshold_m {
                continue;
            }
            let better = match &best {
                None => true,
                Some(b) => angle < b.angle || (angle == b.angle && distance < b.distance),
            };
            if better {
                best = Some(PlaneMatch {
                    observation: i,
                    landmark: lm.id,
                    angle,
                    distance,
                });
            }
        }
        match best {
            Some(m) => candidates.push(m),
            None => out.unmatched_planes.push(i),
        }
    }

    // One observation per landmark: best angular agreement wins.
    candidates.sort_by(|a, b| {
        a.angle
            .partial_cmp(&b.angle)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal))
    });
    let mut used = BTreeSet::new();
    for m in candidates {
        if used.insert(m.landmark) {
            out.plane_matches.push(m);
        } else {
            out.unmatched_planes.push(m.observation);
        }
    }
}

fn associate_points(
    store: &LandmarkStore,
    frame: &Frame,
    pose: &Transform3D,
    cfg: &AssociationConfig,
    out: &mut Associations,
) {
    let cam_from_map = pose.inverse();
    let mut candidates: Vec<PointMatch> = Vec::new();
    let mut visible: Vec<LandmarkId> = Vec::new();

    for lm in store.valid_points() {
        let in_cam = cam_from_map.transform_point(&lm.position);
        if in_cam.z <= 0.0 || in_cam.z > cfg.point_depth_gate_m {
            continue;
        }
        let Some((u, v)) = frame.intrinsics.project(&in_cam) else {
            continue;
        };
        if !frame.intrinsics.contains(u, v) {
            continue;
        }
        visible.push(lm.id);

        let mut best: Option<PointMatch> = None;
        for (k, kp) in frame.keypoints.iter().enumerate() {
            let du = kp.u as f64 - u;
            let dv = kp.v as f64 - v;
            if du * du + dv * dv > cfg.point_gate_px * cfg.point_gate_px {
                continue;
            }
            let Some(dist) = lm.descriptor.distance(&frame.descriptors[k]) else {
                continue;
            };
            if dist > cfg.descriptor_threshold {
                continue;
            }
            if best.as_ref().map_or(true, |b| dist < b.distance) {
                best = Some(PointMatch {
                    keypoint: k,
                    landmark: lm.id,
                    distance: dist,
                });
            }
        }
        if let Some(m) = best {
            candidates.push(m);
        }
    }

    // One keypoint per landmark and vice versa, closest descriptors first.
    candidates.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut used_kp = BTreeSet::new();
    let mut used_lm = BTreeSet::new();
    for m in candidates {
        if used_kp.contains(&m.keypoint) || used_lm.contains(&m.landmark) {
            continue;
        }
        used_kp.insert(m.keypoint);
        used_lm.insert(m.landmark);
        out.point_matches.push(m);
    }

    for id in visible {
        if !used_lm.contains(&id) {
            out.missed_points.push(id);
        }
    }
    for (k, p) in frame.points.iter().enumerate() {
        if p.is_some() && !used_kp.contains(&k) {
            out.unmatched_points.push(k);
        }
    }
}

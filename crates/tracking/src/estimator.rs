//! The relative-motion estimator: a cascade of plane, plane+point,
//! point-only, ICP and PnP stages, first validated success wins.

use crate::icp::{self, IcpConfig};
use crate::matcher::{self, Match, MatcherConfig};
use crate::pnp::{self, PnpConfig};
use crate::solvers::{solve_rt_mixed, solve_rt_planes, solve_rt_points, MotionEstimate};
use frame::Frame;
use geometry::{Plane, Transform3D};
use nalgebra::Point3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub ransac_iterations: usize,
    pub ransac_sample_size: usize,
    pub ransac_min_inlier: usize,
    /// Squared Mahalanobis gate for point inliers.
    pub ransac_inlier_max_mahal_distance: f64,
    /// Validator: maximum plausible relative translation (meters).
    pub max_translation_m: f64,
    /// Validator: maximum plausible relative rotation (radians).
    pub max_rotation_rad: f64,
    /// Plane pairing gate: normal angle (radians).
    pub pair_dir_threshold_rad: f64,
    /// Plane pairing gate: offset difference (meters).
    pub pair_dis_threshold_m: f64,
    /// Minimum good matches before ICP / PnP are worth attempting.
    pub min_matches_for_icp: usize,
    pub matcher: MatcherConfig,
    pub icp: IcpConfig,
    pub pnp: PnpConfig,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            ransac_iterations: 200,
            ransac_sample_size: 3,
            ransac_min_inlier: 25,
            ransac_inlier_max_mahal_distance: 3.0,
            max_translation_m: 0.5,
            max_rotation_rad: 0.5,
            pair_dir_threshold_rad: 15.0 * DEG_TO_RAD,
            pair_dis_threshold_m: 0.1,
            min_matches_for_icp: 20,
            matcher: MatcherConfig::default(),
            icp: IcpConfig::default(),
            pnp: PnpConfig::default(),
        }
    }
}

/// A validated relative motion between consecutive frames, mapping
/// current-frame coordinates into the last frame.
#[derive(Debug, Clone)]
pub struct RelativeMotion {
    pub transform: Transform3D,
    pub inliers: usize,
    pub rmse: f64,
}

/// A plane correspondence between the current frame (`obs`) and the last
/// frame (`last`), with its pairing quality.
#[derive(Debug, Clone, Copy)]
pub struct PlanePair {
    pub obs: usize,
    pub last: usize,
    pub angle: f64,
    pub distance: f64,
}

/// Pair current-frame planes with last-frame planes under a prior motion.
/// One-to-one, best angular agreement first.
pub fn plane_pairs(
    last: &Frame,
    current: &Frame,
    prior: &Transform3D,
    dir_threshold: f64,
    dis_threshold: f64,
) -> Vec<PlanePair> {
    let mut pairs = Vec::new();
    for (i, obs) in current.planes.iter().enumerate() {
        let predicted = obs.plane.transformed(prior);
        let mut best: Option<PlanePair> = None;
        for (j, lp) in last.planes.iter().enumerate() {
            let (dir, dis) = predicted.separation(&lp.plane);
            if dir > dir_threshold || dis > dis_threshold {
                continue;
            }
            let candidate = PlanePair {
                obs: i,
                last: j,
                angle: dir,
                distance: dis,
            };
            let better = match &best {
                None => true,
                Some(b) => dir < b.angle || (dir == b.angle && dis < b.distance),
            };
            if better {
                best = Some(candidate);
            }
        }
        if let Some(p) = best {
            pairs.push(p);
        }
    }

    pairs.sort_by(|a, b| {
        a.angle
            .partial_cmp(&b.angle)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal))
    });

    // Enforce one landmark-side plane per pair, best quality wins.
    let mut used = BTreeSet::new();
    pairs.retain(|p| used.insert(p.last));
    pairs
}

pub struct Tracker {
    config: TrackingConfig,
    rng: StdRng,
}

impl Tracker {
    pub fn new(config: TrackingConfig) -> Self {
        Self {
            config,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic RANSAC for tests.
    pub fn with_seed(config: TrackingConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Estimate the relative motion between `last` and `current`, optionally
    /// seeded with an external odometry prior. Returns None when every
    /// cascade stage fails or is rejected by the magnitude validator.
    pub fn track(
        &mut self,
        last: &Frame,
        current: &Frame,
        prior: Option<&Transform3D>,
    ) -> Option<RelativeMotion> {
        let prior_t = prior.copied().unwrap_or_default();

        let pairs = plane_pairs(
            last,
            current,
            &prior_t,
            self.config.pair_dir_threshold_rad,
            self.config.pair_dis_threshold_m,
        );
        debug!(pairs = pairs.len(), "plane correspondences");

        // Stage 1: plane-only alignment over all pair triples.
        if pairs.len() >= 3 {
            let est = self.planes_stage(last, current, &pairs);
            if est.valid {
                if let Some(motion) = self.validated(est.to_transform(), est.inliers, est.rmse) {
                    debug!(rmse = motion.rmse, "tracked via planes");
                    return Some(motion);
                }
            }
        }

        // Stage 2: keypoint matching feeds every remaining stage.
        let good = matcher::match_features(last, current, &self.config.matcher);
        debug!(good_matches = good.len(), "feature matching");

        // Stage 3: mixed plane+point RANSAC.
        if !pairs.is_empty() && good.len() >= 3 {
            if let Some((t, inliers, rmse)) = self.planes_points_stage(last, current, &pairs, &good)
            {
                if let Some(motion) = self.validated(t, inliers, rmse) {
                    debug!(inliers, rmse, "tracked via planes+points");
                    return Some(motion);
                }
            }
        }

        // Stage 4: point-only RANSAC with iterative refinement.
        if good.len() >= self.config.ransac_sample_size {
            if let Some((t, inliers, rmse)) = self.points_stage(last, current, &good) {
                if let Some(motion) = self.validated(t, inliers, rmse) {
                    debug!(inliers, rmse, "tracked via points");
                    return Some(motion);
                }
            }
        }

        // Stage 5: ICP on the keypoint clouds.
        if good.len() >= self.config.min_matches_for_icp {
            let est = icp::align(
                &current.feature_cloud(),
                &last.feature_cloud(),
                &self.config.icp,
            );
            if est.valid && est.is_finite() {
                if let Some(motion) = self.validated(est.to_transform(), est.inliers, est.rmse) {
                    debug!(rmse = motion.rmse, "tracked via ICP");
                    return Some(motion);
                }
            }
        }

        // Stage 6: PnP with the last frame's pixels.
        if good.len() >= self.config.min_matches_for_icp {
            if let Some(motion) = self.pnp_stage(last, current, &good, &prior_t) {
                debug!(inliers = motion.inliers, "tracked via PnP");
                return Some(motion);
            }
        }

        warn!("relative motion estimation failed in all cascade stages");
        None
    }

    fn validated(&self, t: Transform3D, inliers: usize, rmse: f64) -> Option<RelativeMotion> {
        if !t.is_finite() {
            return None;
        }
        if t.translation().norm() > self.config.max_translation_m
            || t.rotation_angle() > self.config.max_rotation_rad
        {
            debug!(
                translation = t.translation().norm(),
                rotation = t.rotation_angle(),
                "candidate rejected by magnitude validator"
            );
            return None;
        }
        Some(RelativeMotion {
            transform: t,
            inliers,
            rmse,
        })
    }

    /// Exhaustive iteration over unordered pair triples; solver rejects
    /// degenerate triples, best plane RMSE wins.
    fn planes_stage(&self, last: &Frame, current: &Frame, pairs: &[PlanePair]) -> MotionEstimate {
        if current.planes.len() < 3 || last.planes.len() < 3 {
            return MotionEstimate::invalid();
        }
        let mut best = MotionEstimate::invalid();
        let mut real_iterations = 0usize;
        let mut valid_iterations = 0usize;
        for x1 in 0..pairs.len().saturating_sub(2) {
            for x2 in (x1 + 1)..pairs.len().saturating_sub(1) {
                for x3 in (x2 + 1)..pairs.len() {
                    real_iterations += 1;
                    let triple = [pairs[x1], pairs[x2], pairs[x3]];
                    let from: Vec<Plane> =
                        triple.iter().map(|p| current.planes[p.obs].plane).collect();
                    let to: Vec<Plane> = triple.iter().map(|p| last.planes[p.last].plane).collect();
                    let est = solve_rt_planes(&from, &to);
                    if est.valid {
                        valid_iterations += 1;
                        if est.rmse < best.rmse {
                            best = est;
                        }
                    }
                }
            }
        }
        debug!(real_iterations, valid_iterations, "plane triple search");
        best
    }

    fn planes_points_stage(
        &mut self,
        last: &Frame,
        current: &Frame,
        pairs: &[PlanePair],
        good: &[Match],
    ) -> Option<(Transform3D, usize, f64)> {
        let sets = mixed_sample_sets(last, current, pairs);
        if sets.is_empty() {
            return None;
        }
        let max_dist = self.config.ransac_inlier_max_mahal_distance;
        let max_iter = self.config.ransac_iterations;
        let min_inlier = (0.6 * good.len() as f64) as usize;

        let mut best_t = Transform3D::identity();
        let mut best_matches: Vec<Match> = Vec::new();
        let mut best_err = 1e9;
        let mut real_iterations = 0usize;
        let mut valid_iterations = 0usize;

        let mut n = 0usize;
        while n < max_iter {
            n += 1;
            real_iterations += 1;

            let set = pick_set_prefer_good(&mut self.rng, &sets);
            let needed = 3 - set.len();
            let sampled = sample_matches_prefer_good(&mut self.rng, needed, good);
            if sampled.len() < needed {
                continue;
            }
            if !mixed_sample_consistent(last, current, pairs, set, &sampled) {
                continue;
            }

            let mut from_planes = Vec::with_capacity(set.len());
            let mut to_planes = Vec::with_capacity(set.len());
            for &pi in set {
                from_planes.push(current.planes[pairs[pi].obs].plane);
                to_planes.push(last.planes[pairs[pi].last].plane);
            }
            let mut from_points = Vec::with_capacity(needed);
            let mut to_points = Vec::with_capacity(needed);
            for m in &sampled {
                let (Some(to), Some(from)) = (last.points[m.query], current.points[m.train])
                else {
                    continue;
                };
                from_points.push(from);
                to_points.push(to);
            }
            if from_points.len() != needed {
                continue;
            }

            let est = solve_rt_mixed(&from_planes, &to_planes, &from_points, &to_points);
            if !est.valid || !est.is_finite() {
                continue;
            }
            let t = est.to_transform();
            let (inliers, err) = matcher::correspondence_inliers(good, &t, last, current, max_dist);
            if inliers.len() > min_inlier && err < max_dist {
                valid_iterations += 1;
                if inliers.len() > best_matches.len() && err < best_err {
                    best_matches = inliers;
                    best_err = err;
                    best_t = t;
                    // Iterations with a dominant consensus count manyfold.
                    let ratio = best_matches.len() as f64 / good.len() as f64;
                    if ratio > 0.5 {
                        n += max_iter / 10;
                    }
                    if ratio > 0.7 {
                        n += max_iter / 10;
                    }
                    if ratio > 0.8 {
                        n += max_iter / 10;
                    }
                    if ratio > 0.9 {
                        n += max_iter / 5;
                    }
                    if ratio > 0.95 {
                        n += max_iter * 3 / 10;
                    }
                }
            }
        }

        debug!(real_iterations, valid_iterations, "plane/point RANSAC");
        (best_matches.len() > min_inlier && best_err < max_dist)
            .then(|| (best_t, best_matches.len(), best_err))
    }

    fn points_stage(
        &mut self,
        last: &Frame,
        current: &Frame,
        good: &[Match],
    ) -> Option<(Transform3D, usize, f64)> {
        let sample_size = self.config.ransac_sample_size;
        let max_dist = self.config.ransac_inlier_max_mahal_distance;
        let min_inlier = self
            .config
            .ransac_min_inlier
            .min((0.6 * good.len() as f64) as usize)
            .max(sample_size);

        let mut best: Option<(Transform3D, Vec<Match>, f64)> = None;
        let mut valid_iterations = 0usize;
        let mut real_iterations = 0usize;

        let mut n = 0usize;
        while n < self.config.ransac_iterations && good.len() >= sample_size {
            n += 1;
            real_iterations += 1;
            let sample = sample_matches_prefer_good(&mut self.rng, sample_size, good);
            if sample.len() < sample_size {
                break;
            }
            let Some((t, inliers, err)) =
                refine_hypothesis(last, current, good, sample, min_inlier, max_dist)
            else {
                continue;
            };
            valid_iterations += 1;

            let (best_len, best_err) = best
                .as_ref()
                .map(|(_, m, e)| (m.len(), *e))
                .unwrap_or((0, 1e6));
            if err <= best_err && inliers.len() >= best_len && inliers.len() >= min_inlier {
                let ratio = inliers.len() as f64 / good.len() as f64;
                best = Some((t, inliers, err));
                if ratio > 0.5 {
                    n += 10;
                }
                if ratio > 0.75 {
                    n += 10;
                }
                if ratio > 0.8 {
                    break;
                }
            }
        }

        if valid_iterations == 0 {
            // Maybe no depth agreement at all. Retry once from identity.
            debug!("no valid point RANSAC iteration, retrying with identity seed");
            let identity = Transform3D::identity();
            let (seed, err) =
                matcher::correspondence_inliers(good, &identity, last, current, max_dist);
            if seed.len() > sample_size {
                if let Some((t, inliers, refined_err)) =
                    refine_hypothesis(last, current, good, seed.clone(), min_inlier, max_dist)
                {
                    if inliers.len() >= min_inlier {
                        best = Some((t, inliers, refined_err));
                    }
                } else if err < max_dist && seed.len() >= min_inlier {
                    best = Some((identity, seed, err));
                }
            }
        }

        debug!(real_iterations, valid_iterations, "point RANSAC");
        best.filter(|(_, m, _)| m.len() >= min_inlier)
            .map(|(t, m, e)| (t, m.len(), e))
    }

    fn pnp_stage(
        &mut self,
        last: &Frame,
        current: &Frame,
        good: &[Match],
        prior: &Transform3D,
    ) -> Option<RelativeMotion> {
        let mut points = Vec::with_capacity(good.len());
        let mut pixels = Vec::with_capacity(good.len());
        for m in good {
            let Some(p) = current.points[m.train] else {
                continue;
            };
            let kp = &last.keypoints[m.query];
            points.push(p);
            pixels.push((kp.u as f64, kp.v as f64));
        }
        let est = pnp::solve_ransac(
            &points,
            &pixels,
            &last.intrinsics,
            prior,
            &self.config.pnp,
            &mut self.rng,
        );
        if !est.valid {
            return None;
        }
        self.validated(est.to_transform(), est.inliers, est.rmse)
    }
}

/// Re-solve Umeyama on the current inlier set until it stops improving,
/// at most 20 rounds. Returns the refined transform with its consensus.
fn refine_hypothesis(
    last: &Frame,
    current: &Frame,
    good: &[Match],
    seed: Vec<Match>,
    min_inlier: usize,
    max_dist: f64,
) -> Option<(Transform3D, Vec<Match>, f64)> {
    let mut inlier = seed;
    let mut refined: Option<(Transform3D, Vec<Match>, f64)> = None;

    for _ in 0..20 {
        let mut from = Vec::with_capacity(inlier.len());
        let mut to = Vec::with_capacity(inlier.len());
        for m in &inlier {
            if let (Some(t), Some(f)) = (last.points[m.query], current.points[m.train]) {
                to.push(t);
                from.push(f);
            }
        }
        let est = solve_rt_points(&from, &to);
        if !est.valid || !est.is_finite() {
            break;
        }
        let t = est.to_transform();
        let (new_inliers, err) = matcher::correspondence_inliers(good, &t, last, current, max_dist);
        if new_inliers.len() < min_inlier || err > max_dist {
            break;
        }
        let (prev_len, prev_err) = refined
            .as_ref()
            .map(|(_, m, e)| (m.len(), *e))
            .unwrap_or((0, 1e6));
        if new_inliers.len() > prev_len && err < prev_err {
            inlier = new_inliers.clone();
            refined = Some((t, new_inliers, err));
        } else {
            break;
        }
    }
    refined
}

/// Candidate plane sample sets: all non-coplanar unordered 2-combinations
/// (checked in both frames), then every singleton. Index lists into `pairs`.
fn mixed_sample_sets(last: &Frame, current: &Frame, pairs: &[PlanePair]) -> Vec<Vec<usize>> {
    let coplanar_thresh = 15.0 * DEG_TO_RAD;
    let mut sets = Vec::new();
    for i in 0..pairs.len() {
        for j in (i + 1)..pairs.len() {
            let cur_angle = current.planes[pairs[i].obs]
                .plane
                .angle_to(&current.planes[pairs[j].obs].plane);
            let last_angle = last.planes[pairs[i].last]
                .plane
                .angle_to(&last.planes[pairs[j].last].plane);
            if cur_angle < coplanar_thresh || last_angle < coplanar_thresh {
                continue;
            }
            sets.push(vec![i, j]);
        }
    }
    for i in 0..pairs.len() {
        sets.push(vec![i]);
    }
    sets
}

/// Geometric consistency of a minimal plane+point sample between frames.
fn mixed_sample_consistent(
    last: &Frame,
    current: &Frame,
    pairs: &[PlanePair],
    set: &[usize],
    matches: &[Match],
) -> bool {
    let dir_threshold = 8.0 * DEG_TO_RAD;
    let dis_threshold = 0.1;

    let point_pair = |m: &Match| -> Option<(Point3<f64>, Point3<f64>)> {
        Some((last.points[m.query]?, current.points[m.train]?))
    };

    match (set.len(), matches.len()) {
        (2, 1) => {
            let (l0, l1) = (
                last.planes[pairs[set[0]].last].plane,
                last.planes[pairs[set[1]].last].plane,
            );
            let (c0, c1) = (
                current.planes[pairs[set[0]].obs].plane,
                current.planes[pairs[set[1]].obs].plane,
            );
            // Inter-plane angle must agree across frames.
            if (l0.angle_to(&l1) - c0.angle_to(&c1)).abs() > dir_threshold {
                return false;
            }
            let Some((to, from)) = point_pair(&matches[0]) else {
                return false;
            };
            // Point-to-plane distances must agree for both planes.
            (l0.distance_to_point(&to) - c0.distance_to_point(&from)).abs() <= dis_threshold
                && (l1.distance_to_point(&to) - c1.distance_to_point(&from)).abs() <= dis_threshold
        }
        (1, 2) => {
            let lp = last.planes[pairs[set[0]].last].plane;
            let cp = current.planes[pairs[set[0]].obs].plane;
            let (Some((to0, from0)), Some((to1, from1))) =
                (point_pair(&matches[0]), point_pair(&matches[1]))
            else {
                return false;
            };
            // The two points must be well separated and length-consistent.
            let d_last = (to0 - to1).norm();
            let d_cur = (from0 - from1).norm();
            if d_last < 0.2 || d_cur < 0.2 || (d_last - d_cur).abs() > dis_threshold {
                return false;
            }
            (lp.distance_to_point(&to0) - cp.distance_to_point(&from0)).abs() <= dis_threshold
                && (lp.distance_to_point(&to1) - cp.distance_to_point(&from1)).abs() <= dis_threshold
        }
        _ => false,
    }
}

/// Two uniform draws, keep the smaller index: biases toward better-ranked
/// sample sets without excluding any.
fn pick_set_prefer_good<'a>(rng: &mut StdRng, sets: &'a [Vec<usize>]) -> &'a [usize] {
    let a = rng.gen_range(0..sets.len());
    let b = rng.gen_range(0..sets.len());
    &sets[a.min(b)]
}

/// Draw `n` distinct matches, biased toward lower (better) indices.
fn sample_matches_prefer_good(rng: &mut StdRng, n: usize, matches: &[Match]) -> Vec<Match> {
    let mut ids = BTreeSet::new();
    let mut safety = 0;
    while ids.len() < n && matches.len() >= n {
        let a = rng.gen_range(0..matches.len());
        let b = rng.gen_range(0..matches.len());
        ids.insert(a.min(b));
        safety += 1;
        if safety > 2000 {
            warn!("sampling failed to produce distinct matches");
            break;
        }
    }
    ids.into_iter().map(|i| matches[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::{Descriptor, Intrinsics, Keypoint, PlaneObservation};

    fn intrinsics() -> Intrinsics {
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

    fn descriptor(seed: u64) -> Descriptor {
        let mut bytes = [0u8; 32];
        let mut state = seed.wrapping_mul(0x9E3779B97F4A7C15).wrapping_add(1);
        for b in bytes.iter_mut() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            *b = (state & 0xFF) as u8;
        }
        Descriptor::Binary(bytes)
    }

    fn landmark_points() -> Vec<Point3<f64>> {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..5 {
                pts.push(Point3::new(
                    -0.7 + 0.26 * i as f64,
                    -0.5 + 0.24 * j as f64,
                    1.6 + 0.2 * ((i * 2 + j) % 4) as f64,
                ));
            }
        }
        pts
    }

    fn room_planes() -> Vec<Plane> {
        vec![
            Plane::from_coefficients(0.0, 0.0, 1.0, -3.0), // front wall
            Plane::from_coefficients(1.0, 0.0, 0.0, 2.0),  // side wall
            Plane::from_coefficients(0.0, 1.0, 0.0, 1.5),  // floor
        ]
    }

    /// Build a frame observing the given map points and planes from `pose`.
    fn observe(pose: &Transform3D, points: &[Point3<f64>], planes: &[Plane]) -> Frame {
        let intr = intrinsics();
        let cam_from_map = pose.inverse();
        let mut keypoints = Vec::new();
        let mut descriptors = Vec::new();
        let mut frame_points = Vec::new();
        for (i, p) in points.iter().enumerate() {
            let pc = cam_from_map.transform_point(p);
            let Some((u, v)) = intr.project(&pc) else {
                continue;
            };
            keypoints.push(Keypoint {
                u: u as f32,
                v: v as f32,
                response: 1.0,
            });
            descriptors.push(descriptor(i as u64));
            frame_points.push(Some(pc));
        }
        let plane_obs = planes
            .iter()
            .map(|p| {
                let cam_plane = p.transformed(&cam_from_map);
                let centroid = Point3::from(
                    cam_plane.normal().into_inner() * -cam_plane.d(),
                );
                PlaneObservation {
                    plane: cam_plane,
                    inliers: Vec::new(),
                    centroid,
                    hull: Vec::new(),
                }
            })
            .collect();
        Frame {
            stamp: 0.0,
            seq: 0,
            intrinsics: intr,
            keypoints,
            descriptors,
            points: frame_points,
            planes: plane_obs,
            pose: Transform3D::identity(),
            valid: false,
            keyframe: false,
        }
    }

    fn assert_close(motion: &RelativeMotion, expected: &Transform3D, tol_t: f64, tol_r: f64) {
        let diff = motion.transform.relative_to(expected);
        assert!(
            diff.translation().norm() < tol_t,
            "translation off by {}",
            diff.translation().norm()
        );
        assert!(
            diff.rotation_angle() < tol_r,
            "rotation off by {}",
            diff.rotation_angle()
        );
    }

    #[test]
    fn identical_frames_give_identity() {
        let pose = Transform3D::identity();
        let frame = observe(&pose, &landmark_points(), &room_planes());
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 1);
        let motion = tracker.track(&frame, &frame.clone(), None).unwrap();
        assert!(motion.transform.translation().norm() < 1e-3);
        assert!(motion.transform.rotation_angle() < 0.1 * DEG_TO_RAD);
    }

    #[test]
    fn plane_only_tracking() {
        // No keypoints at all: stage 1 must carry the frame.
        let last = observe(&Transform3D::identity(), &[], &room_planes());
        let delta = Transform3D::from_xyz_rpy(0.03, -0.01, 0.02, 0.0, 0.01, 0.02);
        let current = observe(&delta, &[], &room_planes());
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 2);
        let motion = tracker.track(&last, &current, None).unwrap();
        assert_close(&motion, &delta, 1e-6, 1e-6);
    }

    #[test]
    fn point_only_tracking() {
        // No planes: the cascade must fall through to point RANSAC.
        let last = observe(&Transform3D::identity(), &landmark_points(), &[]);
        let delta = Transform3D::from_xyz_rpy(0.02, 0.015, -0.01, 0.005, -0.004, 0.01);
        let current = observe(&delta, &landmark_points(), &[]);
        let mut config = TrackingConfig::default();
        config.ransac_min_inlier = 15;
        let mut tracker = Tracker::with_seed(config, 3);
        let motion = tracker.track(&last, &current, None).unwrap();
        assert_close(&motion, &delta, 1e-6, 1e-6);
        assert!(motion.inliers >= 15);
    }

    #[test]
    fn mixed_tracking_with_two_planes() {
        // Two planes only: stage 1 cannot run, stage 3 must succeed.
        let planes = vec![room_planes()[0], room_planes()[1]];
        let last = observe(&Transform3D::identity(), &landmark_points(), &planes);
        let delta = Transform3D::from_xyz_rpy(0.02, -0.02, 0.01, 0.0, 0.008, -0.01);
        let current = observe(&delta, &landmark_points(), &planes);
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 4);
        let motion = tracker.track(&last, &current, None).unwrap();
        assert_close(&motion, &delta, 1e-4, 1e-4);
    }

    #[test]
    fn implausible_motion_is_rejected() {
        let last = observe(&Transform3D::identity(), &[], &room_planes());
        let delta = Transform3D::from_xyz_rpy(2.5, 0.0, 0.0, 0.0, 0.0, 0.0);
        let current = observe(&delta, &[], &room_planes());
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 5);
        assert!(tracker.track(&last, &current, None).is_none());
    }

    #[test]
    fn no_depth_means_no_point_tracking() {
        let last = observe(&Transform3D::identity(), &landmark_points(), &[]);
        let mut current = observe(&Transform3D::identity(), &landmark_points(), &[]);
        for p in current.points.iter_mut() {
            *p = None;
        }
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 6);
        assert!(tracker.track(&last, &current, None).is_none());
    }

    #[test]
    fn degenerate_parallel_planes_fail() {
        // Three nearly parallel planes cannot constrain the motion.
        let planes = vec![
            Plane::from_coefficients(0.0, 0.0, 1.0, -3.0),
            Plane::from_coefficients(0.0, 0.02, 1.0, -3.5),
            Plane::from_coefficients(0.02, 0.0, 1.0, -4.0),
        ];
        let last = observe(&Transform3D::identity(), &[], &planes);
        let current = observe(&Transform3D::identity(), &[], &planes);
        let mut tracker = Tracker::with_seed(TrackingConfig::default(), 7);
        assert!(tracker.track(&last, &current, None).is_none());
    }

    #[test]
    fn plane_pairs_respect_prior() {
        let planes = room_planes();
        let last = observe(&Transform3D::identity(), &[], &planes);
        let delta = Transform3D::from_xyz_rpy(0.05, 0.0, 0.0, 0.0, 0.0, 0.05);
        let current = observe(&delta, &[], &planes);
        let pairs = plane_pairs(&last, &current, &delta, 15.0 * DEG_TO_RAD, 0.1);
        assert_eq!(pairs.len(), 3);
        for p in &pairs {
            assert!(p.angle < 1e-6);
        }
    }
}

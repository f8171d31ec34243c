//! Descriptor matching and inlier scoring under a candidate transform.

use frame::{Descriptor, Frame};
use geometry::Transform3D;
use serde::{Deserialize, Serialize};

/// Binary matches with at least half the bits differing are random noise.
const BINARY_REJECT_BITS: u32 = 128;
/// Guards the threshold filter against a zero best distance.
const MIN_DISTANCE_FLOOR: f64 = 0.02;

/// A correspondence between a keypoint of the last frame (`query`) and one
/// of the current frame (`train`).
#[derive(Debug, Clone)]
pub struct Match {
    pub query: usize,
    pub train: usize,
    pub distance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Threshold-mode filter: keep matches below `threshold * min_distance`.
    pub good_match_threshold: f64,
    /// When non-zero, take the best K matches with valid depth instead.
    pub min_good_match_size: usize,
    /// Lowe ratio for float descriptors.
    pub float_ratio: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            good_match_threshold: 4.0,
            min_good_match_size: 0,
            float_ratio: 0.8,
        }
    }
}

/// Match descriptors of `last` against `current` and return the filtered
/// "good" matches, ordered by ascending distance. Matches where either
/// endpoint has no valid depth are discarded.
pub fn match_features(last: &Frame, current: &Frame, cfg: &MatcherConfig) -> Vec<Match> {
    let mut matches = Vec::new();

    for (qi, qd) in last.descriptors.iter().enumerate() {
        let mut best: Option<(usize, f64)> = None;
        let mut second = f64::INFINITY;
        for (ti, td) in current.descriptors.iter().enumerate() {
            let Some(d) = qd.distance(td) else { continue };
            match best {
                Some((_, bd)) if d >= bd => {
                    if d < second {
                        second = d;
                    }
                }
                Some((_, bd)) => {
                    second = bd;
                    best = Some((ti, d));
                }
                None => best = Some((ti, d)),
            }
        }
        let Some((ti, d)) = best else { continue };

        let distance = match qd {
            Descriptor::Binary(_) => {
                if d as u32 >= BINARY_REJECT_BITS {
                    continue;
                }
                d / 256.0
            }
            Descriptor::Float(_) => {
                if second.is_finite() && d >= cfg.float_ratio * second {
                    continue;
                }
                d
            }
        };
        matches.push(Match {
            query: qi,
            train: ti,
            distance,
        });
    }

    matches.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.query.cmp(&b.query))
    });

    let depth_ok = |m: &Match| -> bool {
        last.points.get(m.query).map_or(false, Option::is_some)
            && current.points.get(m.train).map_or(false, Option::is_some)
    };

    let mut good = Vec::new();
    if cfg.min_good_match_size > 0 {
        for m in &matches {
            if good.len() >= cfg.min_good_match_size {
                break;
            }
            if depth_ok(m) {
                good.push(m.clone());
            }
        }
    } else if let Some(first) = matches.first() {
        let min_dis = first.distance.max(MIN_DISTANCE_FLOOR);
        for m in &matches {
            if m.distance >= cfg.good_match_threshold * min_dis {
                break;
            }
            if depth_ok(m) {
                good.push(m.clone());
            }
        }
    }
    good
}

/// Depth standard deviation model: quadratic accuracy decay with range.
fn depth_sigma(z: f64) -> f64 {
    0.001 + 0.003 * z * z
}

/// Inlier selection under a candidate transform.
///
/// The error is the squared point residual scaled by the isotropic
/// depth-variance of both endpoints (a Mahalanobis-style distance);
/// matches above `max_dist` or with missing depth are not inliers.
/// Returns the inliers and the RMS error over them (1e9 when fewer
/// than three survive).
pub fn correspondence_inliers(
    matches: &[Match],
    transform: &Transform3D,
    last: &Frame,
    current: &Frame,
    max_dist: f64,
) -> (Vec<Match>, f64) {
    let mut inliers = Vec::with_capacity(matches.len());
    let mut sum = 0.0;
    for m in matches {
        let (Some(to), Some(from)) = (last.points[m.query], current.points[m.train]) else {
            continue;
        };
        let predicted = transform.transform_point(&from);
        let var = {
            let sf = depth_sigma(from.z);
            let st = depth_sigma(to.z);
            sf * sf + st * st
        };
        let mahal = (to - predicted).norm_squared() / var;
        if !mahal.is_finite() || mahal > max_dist {
            continue;
        }
        sum += mahal;
        inliers.push(m.clone());
    }

    let rmse = if inliers.len() < 3 {
        1e9
    } else {
        (sum / inliers.len() as f64).sqrt()
    };
    (inliers, rmse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::{Descriptor, Intrinsics, Keypoint};
    use nalgebra::Point3;

    fn descriptor(seed: u8) -> Descriptor {
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        Descriptor::Binary(bytes)
    }

    fn frame_with(descriptors: Vec<Descriptor>, points: Vec<Option<Point3<f64>>>) -> Frame {
        let keypoints = points
            .iter()
            .enumerate()
            .map(|(i, _)| Keypoint {
                u: 10.0 * i as f32,
                v: 10.0,
                response: 1.0,
            })
            .collect();
        Frame {
            stamp: 0.0,
            seq: 0,
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
                width: 640,
                height: 480,
                depth_scale: 1.0,
            },
            keypoints,
            descriptors,
            points,
            planes: Vec::new(),
            pose: Transform3D::identity(),
            valid: false,
            keyframe: false,
        }
    }

    #[test]
    fn matches_identical_descriptors() {
        let descs = vec![descriptor(1), descriptor(2), descriptor(3)];
        let pts: Vec<_> = (0..3).map(|i| Some(Point3::new(i as f64, 0.0, 1.0))).collect();
        let last = frame_with(descs.clone(), pts.clone());
        let current = frame_with(descs, pts);
        let good = match_features(&last, &current, &MatcherConfig::default());
        assert_eq!(good.len(), 3);
        for m in &good {
            assert_eq!(m.query, m.train);
        }
    }

    #[test]
    fn missing_depth_discards_match() {
        let descs = vec![descriptor(1), descriptor(2)];
        let last = frame_with(
            descs.clone(),
            vec![Some(Point3::new(0.0, 0.0, 1.0)), None],
        );
        let current = frame_with(
            descs,
            vec![Some(Point3::new(0.0, 0.0, 1.0)), Some(Point3::new(1.0, 0.0, 1.0))],
        );
        let good = match_features(&last, &current, &MatcherConfig::default());
        assert_eq!(good.len(), 1);
        assert_eq!(good[0].query, 0);
    }

    #[test]
    fn random_binary_match_rejected() {
        let a = Descriptor::Binary([0x00; 32]);
        let b = Descriptor::Binary([0xFF; 32]); // 256 differing bits
        let last = frame_with(vec![a], vec![Some(Point3::new(0.0, 0.0, 1.0))]);
        let current = frame_with(vec![b], vec![Some(Point3::new(0.0, 0.0, 1.0))]);
        assert!(match_features(&last, &current, &MatcherConfig::default()).is_empty());
    }

    #[test]
    fn inliers_under_identity() {
        let descs = vec![descriptor(1), descriptor(2), descriptor(3)];
        let pts: Vec<_> = (0..3).map(|i| Some(Point3::new(i as f64, 0.0, 1.5))).collect();
        let last = frame_with(descs.clone(), pts.clone());
        let current = frame_with(descs, pts);
        let matches = match_features(&last, &current, &MatcherConfig::default());
        let (inliers, rmse) =
            correspondence_inliers(&matches, &Transform3D::identity(), &last, &current, 3.0);
        assert_eq!(inliers.len(), 3);
        assert!(rmse < 1e-9);
    }

    #[test]
    fn gross_outlier_excluded() {
        let descs = vec![descriptor(1), descriptor(2), descriptor(3), descriptor(4)];
        let mut last_pts: Vec<_> =
            (0..4).map(|i| Some(Point3::new(i as f64, 0.0, 1.5))).collect();
        let current_pts = last_pts.clone();
        last_pts[3] = Some(Point3::new(3.0, 2.0, 1.5)); // 2 m off
        let last = frame_with(descs.clone(), last_pts);
        let current = frame_with(descs, current_pts);
        let matches = match_features(&last, &current, &MatcherConfig::default());
        let (inliers, _) =
            correspondence_inliers(&matches, &Transform3D::identity(), &last, &current, 3.0);
        assert_eq!(inliers.len(), 3);
    }
}

//! Keyframe promotion policy.

use geometry::Transform3D;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyframeConfig {
    /// Relative rotation since the last keyframe (radians).
    pub rot_threshold_rad: f64,
    /// Relative translation since the last keyframe (meters).
    pub trans_threshold_m: f64,
    /// Unmatched observations that warrant a new keyframe.
    pub new_landmark_threshold: usize,
    /// Time since the last keyframe (seconds).
    pub dt_threshold_s: f64,
}

impl Default for KeyframeConfig {
    fn default() -> Self {
        Self {
            rot_threshold_rad: 5.0_f64.to_radians(),
            trans_threshold_m: 0.1,
            new_landmark_threshold: 5,
            dt_threshold_s: 2.0,
        }
    }
}

/// A frame becomes a keyframe if ANY of the criteria fires.
pub fn should_insert_keyframe(
    cfg: &KeyframeConfig,
    delta_from_last_keyframe: &Transform3D,
    unmatched_observations: usize,
    dt_since_last_keyframe: f64,
) -> bool {
    delta_from_last_keyframe.rotation_angle() > cfg.rot_threshold_rad
        || delta_from_last_keyframe.translation().norm() > cfg.trans_threshold_m
        || unmatched_observations > cfg.new_landmark_threshold
        || dt_since_last_keyframe > cfg.dt_threshold_s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_frame_is_not_a_keyframe() {
        let cfg = KeyframeConfig::default();
        assert!(!should_insert_keyframe(
            &cfg,
            &Transform3D::identity(),
            0,
            0.1
        ));
    }

    #[test]
    fn each_criterion_fires_alone() {
        let cfg = KeyframeConfig::default();
        let rot = Transform3D::from_xyz_rpy(0.0, 0.0, 0.0, 0.0, 0.0, 0.2);
        assert!(should_insert_keyframe(&cfg, &rot, 0, 0.0));

        let trans = Transform3D::from_xyz_rpy(0.2, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert!(should_insert_keyframe(&cfg, &trans, 0, 0.0));

        assert!(should_insert_keyframe(&cfg, &Transform3D::identity(), 6, 0.0));
        assert!(should_insert_keyframe(&cfg, &Transform3D::identity(), 0, 3.0));
    }
}

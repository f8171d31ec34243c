//! Landmark bookkeeping for the SLAM map.
//!
//! Two stores indexed by stable ids hold plane and keypoint landmarks;
//! observations are (keyframe, landmark) pairs in a separate relation, so
//! there are no object-to-object pointers. A merged landmark retires its id
//! but keeps a forwarding pointer for graceful lookups.

pub mod association;
pub mod keyframe;

use frame::Descriptor;
use geometry::Plane;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};
use types::{KeyframeId, LandmarkId};

pub use association::{associate, AssociationConfig, Associations, PlaneMatch, PointMatch};
pub use keyframe::{should_insert_keyframe, KeyframeConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Two plane landmarks closer than this in normal angle are merge
    /// candidates (radians).
    pub merge_dir_threshold_rad: f64,
    /// ... and in offset (meters).
    pub merge_dis_threshold_m: f64,
    /// Two point landmarks closer than this are merged (meters).
    pub merge_point_distance_m: f64,
    /// Retire a landmark after this many consecutive failed re-observations.
    pub retire_after_misses: u32,
    /// Landmarks with at least this many observations are never retired.
    pub retire_min_observations: f64,
    /// Cap on stored hull points per plane landmark.
    pub max_hull_points: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            merge_dir_threshold_rad: 5.0_f64.to_radians(),
            merge_dis_threshold_m: 0.05,
            merge_point_distance_m: 0.05,
            retire_after_misses: 5,
            retire_min_observations: 3.0,
            max_hull_points: 64,
        }
    }
}

/// A persistent plane in the map frame.
#[derive(Debug, Clone)]
pub struct PlaneLandmark {
    pub id: LandmarkId,
    pub plane: Plane,
    /// Cumulative observed extent, map frame.
    pub hull: Vec<Point3<f64>>,
    /// Accumulated observation weight (count).
    pub weight: f64,
    pub valid: bool,
    pub merged_into: Option<LandmarkId>,
    misses: u32,
}

/// A persistent 3D keypoint in the map frame.
#[derive(Debug, Clone)]
pub struct PointLandmark {
    pub id: LandmarkId,
    pub position: Point3<f64>,
    /// Representative descriptor: the latest observation.
    pub descriptor: Descriptor,
    pub weight: f64,
    pub valid: bool,
    pub merged_into: Option<LandmarkId>,
    misses: u32,
}

#[derive(Debug)]
pub struct LandmarkStore {
    planes: BTreeMap<LandmarkId, PlaneLandmark>,
    points: BTreeMap<LandmarkId, PointLandmark>,
    plane_observations: Vec<(KeyframeId, LandmarkId)>,
    point_observations: Vec<(KeyframeId, LandmarkId)>,
    next_id: u64,
    config: StoreConfig,
}

impl LandmarkStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            planes: BTreeMap::new(),
            points: BTreeMap::new(),
            plane_observations: Vec::new(),
            point_observations: Vec::new(),
            next_id: 0,
            config,
        }
    }

    fn fresh_id(&mut self) -> LandmarkId {
        let id = LandmarkId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Follow forwarding pointers of merged landmarks.
    pub fn resolve(&self, id: LandmarkId) -> LandmarkId {
        let mut current = id;
        loop {
            let forwarded = self
                .planes
                .get(&current)
                .and_then(|l| l.merged_into)
                .or_else(|| self.points.get(&current).and_then(|l| l.merged_into));
            match forwarded {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    pub fn insert_plane(
        &mut self,
        plane: Plane,
        hull: Vec<Point3<f64>>,
        keyframe: KeyframeId,
    ) -> LandmarkId {
        let id = self.fresh_id();
        self.planes.insert(
            id,
            PlaneLandmark {
                id,
                plane,
                hull,
                weight: 1.0,
                valid: true,
                merged_into: None,
                misses: 0,
            },
        );
        self.plane_observations.push((keyframe, id));
        debug!(%id, "new plane landmark");
        id
    }

    /// Fold a re-observation into the landmark: incremental weighted mean of
    /// the coefficients (weights = observation counts), hull union.
    pub fn observe_plane(
        &mut self,
        id: LandmarkId,
        observed: &Plane,
        hull: &[Point3<f64>],
        keyframe: KeyframeId,
    ) {
        let id = self.resolve(id);
        let max_hull = self.config.max_hull_points;
        if let Some(lm) = self.planes.get_mut(&id) {
            let w = lm.weight;
            let a = lm.plane.coefficients();
            let b = observed.coefficients();
            let merged: Vec<f64> = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (w * x + y) / (w + 1.0))
                .collect();
            lm.plane = Plane::from_coefficients(merged[0], merged[1], merged[2], merged[3]);
            lm.weight = w + 1.0;
            lm.misses = 0;
            lm.hull.extend_from_slice(hull);
            thin_hull(&mut lm.hull, max_hull);
            self.plane_observations.push((keyframe, id));
        }
    }

    /// Overwrite the estimate with the back-end's optimized value.
    pub fn set_plane_estimate(&mut self, id: LandmarkId, plane: Plane) {
        let id = self.resolve(id);
        if let Some(lm) = self.planes.get_mut(&id) {
            lm.plane = plane;
        }
    }

    pub fn insert_point(
        &mut self,
        position: Point3<f64>,
        descriptor: Descriptor,
        keyframe: KeyframeId,
    ) -> LandmarkId {
        let id = self.fresh_id();
        self.points.insert(
            id,
            PointLandmark {
                id,
                position,
                descriptor,
                weight: 1.0,
                valid: true,
                merged_into: None,
                misses: 0,
            },
        );
        self.point_observations.push((keyframe, id));
        id
    }

    pub fn observe_point(
        &mut self,
        id: LandmarkId,
        position: &Point3<f64>,
        descriptor: &Descriptor,
        keyframe: KeyframeId,
    ) {
        let id = self.resolve(id);
        if let Some(lm) = self.points.get_mut(&id) {
            let w = lm.weight;
            lm.position = Point3::from((lm.position.coords * w + position.coords) / (w + 1.0));
            lm.descriptor = descriptor.clone();
            lm.weight = w + 1.0;
            lm.misses = 0;
            self.point_observations.push((keyframe, id));
        }
    }

    pub fn set_point_estimate(&mut self, id: LandmarkId, position: Point3<f64>) {
        let id = self.resolve(id);
        if let Some(lm) = self.points.get_mut(&id) {
            lm.position = position;
        }
    }

    /// A landmark that should have been re-observed but was not. Retires it
    /// after repeated failures, unless it is well established.
    pub fn record_miss(&mut self, id: LandmarkId) {
        let id = self.resolve(id);
        let cfg_misses = self.config.retire_after_misses;
        let cfg_weight = self.config.retire_min_observations;
        if let Some(lm) = self.planes.get_mut(&id) {
            lm.misses += 1;
            if lm.misses >= cfg_misses && lm.weight < cfg_weight {
                lm.valid = false;
                info!(%id, "plane landmark retired");
            }
        } else if let Some(lm) = self.points.get_mut(&id) {
            lm.misses += 1;
            if lm.misses >= cfg_misses && lm.weight < cfg_weight {
                lm.valid = false;
            }
        }
    }

    /// Merge coincident landmarks. The lower id survives; the higher id is
    /// retired with a forwarding pointer.
    pub fn merge_coincident(&mut self) {
        // Planes
        let ids: Vec<LandmarkId> = self
            .planes
            .values()
            .filter(|l| l.valid)
            .map(|l| l.id)
            .collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = (ids[i], ids[j]);
                let (Some(la), Some(lb)) = (self.planes.get(&a), self.planes.get(&b)) else {
                    continue;
                };
                if !la.valid || !lb.valid {
                    continue;
                }
                let (dir, dis) = la.plane.separation(&lb.plane);
                if dir < self.config.merge_dir_threshold_rad
                    && dis < self.config.merge_dis_threshold_m
                {
                    self.merge_planes(a, b);
                }
            }
        }

        // Points
        let ids: Vec<LandmarkId> = self
            .points
            .values()
            .filter(|l| l.valid)
            .map(|l| l.id)
            .collect();
        for i in 0..ids.len() {
            for j in (i + 1)..ids.len() {
                let (a, b) = (ids[i], ids[j]);
                let (Some(la), Some(lb)) = (self.points.get(&a), self.points.get(&b)) else {
                    continue;
                };
                if !la.valid || !lb.valid {
                    continue;
                }
                if (la.position - lb.position).norm() < self.config.merge_point_distance_m {
                    self.merge_points(a, b);
                }
            }
        }
    }

    fn merge_planes(&mut self, a: LandmarkId, b: LandmarkId) {
        let (survivor, retired) = if a < b { (a, b) } else { (b, a) };
        let Some(old) = self.planes.get(&retired).cloned() else {
            return;
        };
        let max_hull = self.config.max_hull_points;
        if let Some(keep) = self.planes.get_mut(&survivor) {
            let total = keep.weight + old.weight;
            let ka = keep.plane.coefficients();
            let kb = old.plane.coefficients();
            let merged: Vec<f64> = ka
                .iter()
                .zip(kb.iter())
                .map(|(x, y)| (keep.weight * x + old.weight * y) / total)
                .collect();
            keep.plane = Plane::from_coefficients(merged[0], merged[1], merged[2], merged[3]);
            keep.weight = total;
            keep.hull.extend_from_slice(&old.hull);
            thin_hull(&mut keep.hull, max_hull);
        }
        if let Some(r) = self.planes.get_mut(&retired) {
            r.valid = false;
            r.merged_into = Some(survivor);
        }
        info!(retired = %retired, survivor = %survivor, "merged plane landmarks");
    }

    fn merge_points(&mut self, a: LandmarkId, b: LandmarkId) {
        let (survivor, retired) = if a < b { (a, b) } else { (b, a) };
        let Some(old) = self.points.get(&retired).cloned() else {
            return;
        };
        if let Some(keep) = self.points.get_mut(&survivor) {
            let total = keep.weight + old.weight;
            keep.position = Point3::from(
                (keep.position.coords * keep.weight + old.position.coords * old.weight) / total,
            );
            keep.weight = total;
        }
        if let Some(r) = self.points.get_mut(&retired) {
            r.valid = false;
            r.merged_into = Some(survivor);
        }
    }

    pub fn valid_planes(&self) -> impl Iterator<Item = &PlaneLandmark> {
        self.planes.values().filter(|l| l.valid)
    }

    pub fn valid_points(&self) -> impl Iterator<Item = &PointLandmark> {
        self.points.values().filter(|l| l.valid)
    }

    pub fn plane(&self, id: LandmarkId) -> Option<&PlaneLandmark> {
        self.planes.get(&self.resolve(id))
    }

    pub fn point(&self, id: LandmarkId) -> Option<&PointLandmark> {
        self.points.get(&self.resolve(id))
    }

    pub fn plane_count(&self) -> usize {
        self.planes.values().filter(|l| l.valid).count()
    }

    pub fn point_count(&self) -> usize {
        self.points.values().filter(|l| l.valid).count()
    }

    /// Keyframes that observed a landmark.
    pub fn observers(&self, id: LandmarkId) -> Vec<KeyframeId> {
        let id = self.resolve(id);
        self.plane_observations
            .iter()
            .chain(self.point_observations.iter())
            .filter(|(_, l)| self.resolve(*l) == id)
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Bound hull growth by dropping every other point once over the cap.
fn thin_hull(hull: &mut Vec<Point3<f64>>, cap: usize) {
    while hull.len() > cap {
        let mut keep = true;
        hull.retain(|_| {
            keep = !keep;
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn store() -> LandmarkStore {
        LandmarkStore::new(StoreConfig::default())
    }

    fn descriptor(seed: u8) -> Descriptor {
        Descriptor::Binary([seed; 32])
    }

    #[test]
    fn plane_observation_averages_coefficients() {
        let mut s = store();
        let id = s.insert_plane(
            Plane::from_coefficients(0.0, 0.0, 1.0, 2.0),
            vec![],
            KeyframeId(0),
        );
        s.observe_plane(
            id,
            &Plane::from_coefficients(0.0, 0.02, 1.0, 2.2),
            &[],
            KeyframeId(1),
        );
        let lm = s.plane(id).unwrap();
        assert_relative_eq!(lm.plane.d(), 2.1, epsilon = 1e-3);
        assert_relative_eq!(lm.weight, 2.0);
        assert_eq!(s.observers(id).len(), 2);
    }

    #[test]
    fn merge_keeps_lower_id_and_forwards() {
        let mut s = store();
        let a = s.insert_plane(
            Plane::from_coefficients(1.0, 0.0, 0.0, 1.0),
            vec![],
            KeyframeId(0),
        );
        let b = s.insert_plane(
            Plane::from_coefficients(1.0, 0.001, 0.0, 1.01),
            vec![],
            KeyframeId(1),
        );
        s.merge_coincident();
        assert_eq!(s.resolve(b), a);
        assert!(s.plane(a).unwrap().valid);
        assert_eq!(s.plane_count(), 1);
        // Lookups through the retired id land on the survivor.
        assert_eq!(s.plane(b).unwrap().id, a);
    }

    #[test]
    fn distinct_planes_do_not_merge() {
        let mut s = store();
        s.insert_plane(
            Plane::from_coefficients(1.0, 0.0, 0.0, 1.0),
            vec![],
            KeyframeId(0),
        );
        s.insert_plane(
            Plane::from_coefficients(0.0, 1.0, 0.0, 1.0),
            vec![],
            KeyframeId(0),
        );
        s.merge_coincident();
        assert_eq!(s.plane_count(), 2);
    }

    #[test]
    fn weak_landmark_retires_after_misses() {
        let mut s = store();
        let id = s.insert_point(Point3::new(0.0, 0.0, 2.0), descriptor(1), KeyframeId(0));
        for _ in 0..5 {
            s.record_miss(id);
        }
        assert!(!s.point(id).unwrap().valid);
    }

    #[test]
    fn established_landmark_survives_misses() {
        let mut s = store();
        let id = s.insert_point(Point3::new(0.0, 0.0, 2.0), descriptor(1), KeyframeId(0));
        s.observe_point(id, &Point3::new(0.0, 0.0, 2.0), &descriptor(1), KeyframeId(1));
        s.observe_point(id, &Point3::new(0.0, 0.0, 2.0), &descriptor(1), KeyframeId(2));
        for _ in 0..10 {
            s.record_miss(id);
        }
        assert!(s.point(id).unwrap().valid);
    }

    #[test]
    fn point_observation_moves_toward_mean() {
        let mut s = store();
        let id = s.insert_point(Point3::new(0.0, 0.0, 2.0), descriptor(1), KeyframeId(0));
        s.observe_point(id, &Point3::new(0.2, 0.0, 2.0), &descriptor(1), KeyframeId(1));
        assert_relative_eq!(s.point(id).unwrap().position.x, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn hull_growth_is_bounded() {
        let mut s = store();
        let id = s.insert_plane(
            Plane::from_coefficients(0.0, 0.0, 1.0, 2.0),
            vec![],
            KeyframeId(0),
        );
        let big: Vec<Point3<f64>> = (0..200)
            .map(|i| Point3::new(i as f64 * 0.01, 0.0, 2.0))
            .collect();
        s.observe_plane(id, &Plane::from_coefficients(0.0, 0.0, 1.0, 2.0), &big, KeyframeId(1));
        assert!(s.plane(id).unwrap().hull.len() <= StoreConfig::default().max_hull_points);
    }
}

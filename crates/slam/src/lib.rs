//! SLAM orchestration.
//!
//! [`SlamSystem`] drives the per-frame pipeline: estimate relative motion
//! against the last frame, compose the absolute pose, associate observations
//! to landmarks, decide keyframes, feed the graph back-end, and publish the
//! map<-odom correction. The surrounding modules provide the ingest pipeline
//! (bounded queue + worker pool), the transform handoff, and the persisted
//! artifact writers.

pub mod artifacts;
pub mod pipeline;
pub mod tf;

use frame::Frame;
use geometry::Transform3D;
use graph::{GraphConfig, KeyframeObservations, PoseGraph};
use mapping::{
    associate, should_insert_keyframe, AssociationConfig, KeyframeConfig, LandmarkStore,
    StoreConfig,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, warn};
use tracking::{RelativeMotion, Tracker, TrackingConfig};
use types::{KeyframeId, PoseRecord, Runtime};

pub use tf::{MapTfHandle, TfConfig};

/// Information weight for between-pose factors from the tracker.
const BETWEEN_WEIGHT: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    /// Feed keyframes to the graph back-end.
    pub do_slam: bool,
    /// Maintain landmark stores and run data association.
    pub do_mapping: bool,
    /// Keep the visual-odometry path output.
    pub do_visual_odometry: bool,
    /// On tracker failure, substitute the odometry prior instead of going lost.
    pub force_odom: bool,
    /// Bypass the tracker entirely and integrate odometry.
    pub use_odom_tracking: bool,
    /// Bootstrap gate: minimum segmented planes...
    pub min_bootstrap_planes: usize,
    /// ...or minimum keypoints with valid depth.
    pub min_bootstrap_keypoints: usize,
    /// Use `init_pose` for the first frame when no odometry is available.
    pub set_init_pose: bool,
    /// x, y, z, roll, pitch, yaw.
    pub init_pose: [f64; 6],
    pub tracking: TrackingConfig,
    pub association: AssociationConfig,
    pub keyframe: KeyframeConfig,
    pub store: StoreConfig,
    pub graph: GraphConfig,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            do_slam: true,
            do_mapping: true,
            do_visual_odometry: true,
            force_odom: false,
            use_odom_tracking: false,
            min_bootstrap_planes: 1,
            min_bootstrap_keypoints: 30,
            set_init_pose: false,
            init_pose: [0.0; 6],
            tracking: TrackingConfig::default(),
            association: AssociationConfig::default(),
            keyframe: KeyframeConfig::default(),
            store: StoreConfig::default(),
            graph: GraphConfig::default(),
        }
    }
}

/// Orchestrator tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingState {
    /// Waiting for a first frame with enough structure.
    Bootstrap,
    Tracking,
    /// Motion estimation failed; re-trying against the last valid frame.
    Lost,
}

/// Per-frame result reported to the caller.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub seq: u64,
    pub stamp: f64,
    pub state: TrackingState,
    /// Pose in the map frame, when established.
    pub pose: Option<Transform3D>,
    pub keyframe: bool,
    /// The back-end rejected the incremental update for this keyframe.
    pub provisional: bool,
    pub inliers: usize,
    pub rmse: f64,
}

/// Bookkeeping for a promoted keyframe.
#[derive(Debug, Clone, Copy)]
pub struct KeyframeMeta {
    pub id: KeyframeId,
    pub stamp: f64,
    pub seq: u64,
}

pub struct SlamSystem {
    config: SlamConfig,
    tracker: Tracker,
    store: LandmarkStore,
    graph: PoseGraph,
    state: TrackingState,
    last_frame: Option<Frame>,
    last_odom: Option<Transform3D>,
    last_vo: Transform3D,
    odom_path: Vec<PoseRecord>,
    vo_path: Vec<PoseRecord>,
    trajectory: Vec<PoseRecord>,
    keyframes: Vec<KeyframeMeta>,
    last_keyframe_pose: Transform3D,
    last_keyframe_stamp: f64,
    last_keyframe_id: Option<KeyframeId>,
    frame_count: u64,
    runtimes: Vec<Runtime>,
    map_tf: MapTfHandle,
}

impl SlamSystem {
    pub fn new(config: SlamConfig) -> Self {
        let tracker = Tracker::new(config.tracking.clone());
        Self::with_tracker(config, tracker)
    }

    /// Deterministic RANSAC for tests.
    pub fn with_seed(config: SlamConfig, seed: u64) -> Self {
        let tracker = Tracker::with_seed(config.tracking.clone(), seed);
        Self::with_tracker(config, tracker)
    }

    fn with_tracker(config: SlamConfig, tracker: Tracker) -> Self {
        let store = LandmarkStore::new(config.store.clone());
        let graph = PoseGraph::new(config.graph.clone());
        Self {
            config,
            tracker,
            store,
            graph,
            state: TrackingState::Bootstrap,
            last_frame: None,
            last_odom: None,
            last_vo: Transform3D::identity(),
            odom_path: Vec::new(),
            vo_path: Vec::new(),
            trajectory: Vec::new(),
            keyframes: Vec::new(),
            last_keyframe_pose: Transform3D::identity(),
            last_keyframe_stamp: 0.0,
            last_keyframe_id: None,
            frame_count: 0,
            runtimes: Vec::new(),
            map_tf: MapTfHandle::default(),
        }
    }

    /// Process one frame with its optional odometry pose. `frame_ms` is the
    /// upstream frame-construction time for the runtime statistics.
    pub fn process(
        &mut self,
        mut frame: Frame,
        odom: Option<Transform3D>,
        frame_ms: f64,
    ) -> FrameOutcome {
        self.frame_count += 1;
        if let Some(o) = &odom {
            self.odom_path.push(o.to_pose_record());
        }

        // Relative-motion prior from odometry.
        let prior = match (&self.last_odom, &odom) {
            (Some(last), Some(current)) => Some(last.relative_to(current)),
            _ => None,
        };
        if odom.is_some() {
            self.last_odom = odom;
        }

        let track_start = Instant::now();
        let mut inliers = 0;
        let mut rmse = 0.0;
        let mut applied_delta: Option<Transform3D> = None;
        let first_frame = self.last_frame.is_none();

        if first_frame {
            if frame.planes.len() >= self.config.min_bootstrap_planes
                || frame.valid_point_count() >= self.config.min_bootstrap_keypoints
            {
                frame.pose = odom.unwrap_or_else(|| self.initial_pose());
                frame.valid = true;
                self.state = TrackingState::Tracking;
                self.last_vo = frame.pose;
                self.vo_path.clear();
                self.vo_path.push(frame.pose.to_pose_record());
                info!(seq = frame.seq, "bootstrap frame accepted");
            } else {
                debug!(seq = frame.seq, "bootstrap frame rejected, too little structure");
                return self.dropped(frame);
            }
        } else {
            let (motion, last_pose) = {
                let last = self.last_frame.as_ref().expect("last frame present");
                let motion: Option<RelativeMotion> =
                    if self.config.use_odom_tracking && prior.is_some() {
                        prior.map(|transform| RelativeMotion {
                            transform,
                            inliers: 0,
                            rmse: 0.0,
                        })
                    } else {
                        self.tracker.track(last, &frame, prior.as_ref())
                    };
                (motion, last.pose)
            };

            let delta = match motion {
                Some(m) => {
                    inliers = m.inliers;
                    rmse = m.rmse;
                    m.transform
                }
                None if self.config.force_odom && prior.is_some() => {
                    warn!(seq = frame.seq, "tracking failed, substituting odometry prior");
                    prior.expect("checked above")
                }
                None => {
                    warn!(seq = frame.seq, "tracking lost");
                    self.state = TrackingState::Lost;
                    return self.dropped(frame);
                }
            };

            frame.pose = last_pose * delta;
            frame.valid = true;
            self.state = TrackingState::Tracking;
            applied_delta = Some(delta);
        }
        let tracking_ms = track_start.elapsed().as_secs_f64() * 1e3;

        // Visual odometry path: dead-reckon the applied deltas.
        if self.config.do_visual_odometry {
            if let Some(delta) = &applied_delta {
                self.last_vo = self.last_vo * delta;
                self.vo_path.push(self.last_vo.to_pose_record());
            }
        }

        // Mapping and back-end.
        let map_start = Instant::now();
        let mut keyframe = false;
        let mut provisional = false;
        if self.config.do_mapping {
            (keyframe, provisional) = self.update_map(&mut frame);
        }
        let mapping_ms = map_start.elapsed().as_secs_f64() * 1e3;

        self.trajectory.push(frame.pose.to_pose_record());

        // map<-odom handoff: planar projection of the full correction.
        if let Some(o) = &odom {
            let correction = frame.pose * o.inverse();
            self.map_tf.store(correction.to_planar());
        }

        if keyframe && !first_frame {
            self.runtimes
                .push(Runtime::new(frame_ms, tracking_ms, mapping_ms));
        }

        let outcome = FrameOutcome {
            seq: frame.seq,
            stamp: frame.stamp,
            state: self.state,
            pose: Some(frame.pose),
            keyframe,
            provisional,
            inliers,
            rmse,
        };

        // The previous frame is released here unless the back-end kept it.
        self.last_frame = Some(frame);
        outcome
    }

    /// Associate, decide keyframe, update stores and the graph.
    /// Returns (keyframe, provisional).
    fn update_map(&mut self, frame: &mut Frame) -> (bool, bool) {
        let assoc = associate(&self.store, frame, &frame.pose, &self.config.association);

        let bootstrap_keyframe = self.keyframes.is_empty();
        let delta = self.last_keyframe_pose.relative_to(&frame.pose);
        let dt = frame.stamp - self.last_keyframe_stamp;
        let keyframe = bootstrap_keyframe
            || should_insert_keyframe(
                &self.config.keyframe,
                &delta,
                assoc.unmatched_count(),
                dt,
            );
        if !keyframe {
            return (false, false);
        }

        for id in &assoc.missed_points {
            self.store.record_miss(*id);
        }

        let kf_id = if self.config.do_slam {
            KeyframeId(self.graph.len() as u64)
        } else {
            KeyframeId(self.keyframes.len() as u64)
        };

        // Fold observations into the store and collect camera-frame factors.
        let mut observations = KeyframeObservations::default();
        for m in &assoc.plane_matches {
            let obs = &frame.planes[m.observation];
            let hull_map: Vec<_> = obs
                .hull
                .iter()
                .map(|h| frame.pose.transform_point(h))
                .collect();
            self.store.observe_plane(
                m.landmark,
                &obs.plane.transformed(&frame.pose),
                &hull_map,
                kf_id,
            );
            observations
                .planes
                .push((self.store.resolve(m.landmark), obs.plane));
        }
        for &i in &assoc.unmatched_planes {
            let obs = &frame.planes[i];
            let hull_map: Vec<_> = obs
                .hull
                .iter()
                .map(|h| frame.pose.transform_point(h))
                .collect();
            let id = self
                .store
                .insert_plane(obs.plane.transformed(&frame.pose), hull_map, kf_id);
            observations.planes.push((id, obs.plane));
        }
        for m in &assoc.point_matches {
            let Some(point) = frame.points[m.keypoint] else {
                continue;
            };
            self.store.observe_point(
                m.landmark,
                &frame.pose.transform_point(&point),
                &frame.descriptors[m.keypoint],
                kf_id,
            );
            observations
                .points
                .push((self.store.resolve(m.landmark), point));
        }
        for &k in &assoc.unmatched_points {
            let Some(point) = frame.points[k] else {
                continue;
            };
            let id = self.store.insert_point(
                frame.pose.transform_point(&point),
                frame.descriptors[k].clone(),
                kf_id,
            );
            observations.points.push((id, point));
        }

        let mut provisional = false;
        if self.config.do_slam {
            let between = self
                .last_keyframe_id
                .map(|prev| (prev, self.last_keyframe_pose.relative_to(&frame.pose), BETWEEN_WEIGHT));
            let result = self.graph.insert_keyframe(frame.pose, between, &observations);
            provisional = result.provisional;
            if !provisional {
                if let Some(optimized) = self.graph.optimized_pose(result.id) {
                    frame.pose = optimized;
                }
                for (id, plane) in self.graph.plane_landmarks() {
                    self.store.set_plane_estimate(*id, *plane);
                }
                for (id, point) in self.graph.point_landmarks() {
                    self.store.set_point_estimate(*id, *point);
                }
            }
            debug_assert_eq!(result.id, kf_id);
        }
        self.store.merge_coincident();

        frame.keyframe = true;
        self.keyframes.push(KeyframeMeta {
            id: kf_id,
            stamp: frame.stamp,
            seq: frame.seq,
        });
        self.last_keyframe_id = Some(kf_id);
        self.last_keyframe_pose = frame.pose;
        self.last_keyframe_stamp = frame.stamp;
        info!(
            %kf_id,
            planes = self.store.plane_count(),
            points = self.store.point_count(),
            provisional,
            "keyframe inserted"
        );
        (true, provisional)
    }

    fn initial_pose(&self) -> Transform3D {
        if self.config.set_init_pose {
            let [x, y, z, roll, pitch, yaw] = self.config.init_pose;
            Transform3D::from_xyz_rpy(x, y, z, roll, pitch, yaw)
        } else {
            Transform3D::identity()
        }
    }

    fn dropped(&mut self, frame: Frame) -> FrameOutcome {
        FrameOutcome {
            seq: frame.seq,
            stamp: frame.stamp,
            state: self.state,
            pose: None,
            keyframe: false,
            provisional: false,
            inliers: 0,
            rmse: 0.0,
        }
    }

    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    pub fn current_pose(&self) -> Option<Transform3D> {
        self.last_frame.as_ref().filter(|f| f.valid).map(|f| f.pose)
    }

    pub fn trajectory(&self) -> &[PoseRecord] {
        &self.trajectory
    }

    pub fn odom_path(&self) -> &[PoseRecord] {
        &self.odom_path
    }

    pub fn visual_odometry_path(&self) -> &[PoseRecord] {
        &self.vo_path
    }

    pub fn store(&self) -> &LandmarkStore {
        &self.store
    }

    pub fn graph(&self) -> &PoseGraph {
        &self.graph
    }

    pub fn keyframes(&self) -> &[KeyframeMeta] {
        &self.keyframes
    }

    /// The optimized keyframe path as serializable records.
    pub fn graph_path_records(&self) -> Vec<PoseRecord> {
        self.graph
            .optimized_path()
            .iter()
            .map(|t| t.to_pose_record())
            .collect()
    }

    pub fn runtimes(&self) -> &[Runtime] {
        &self.runtimes
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn map_tf_handle(&self) -> MapTfHandle {
        self.map_tf.clone()
    }
}

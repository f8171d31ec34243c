//! End-to-end SLAM scenarios against the simulated room.
//!
//! Run with: cargo test --test slam_scenarios

use frame::Frame;
use geometry::Transform3D;
use sim::{trajectory, GridSegmentor, MarkerExtractor, SimCamera, SimConfig, SimWorld,
    TrajectoryPreset};
use slam::{SlamConfig, SlamSystem, TrackingState};

fn render_frame(cam: &mut SimCamera, pose: &Transform3D, stamp: f64, seq: u64) -> Frame {
    let (rgb, depth) = cam.render(pose);
    Frame::from_images(
        stamp,
        seq,
        &rgb,
        &depth,
        cam.intrinsics(),
        &MarkerExtractor,
        &GridSegmentor::default(),
    )
}

fn run_sequence(
    system: &mut SlamSystem,
    poses: &[Transform3D],
    with_odom: bool,
    mutate: impl Fn(usize, &mut Frame),
) {
    let mut cam = SimCamera::new(SimWorld::room(), SimConfig::default());
    for (i, pose) in poses.iter().enumerate() {
        let mut frame = render_frame(&mut cam, pose, i as f64 * 0.1, i as u64);
        mutate(i, &mut frame);
        let odom = with_odom.then_some(*pose);
        system.process(frame, odom, 1.0);
    }
}

fn final_pose(system: &SlamSystem) -> Transform3D {
    system.current_pose().expect("system should be tracking")
}

/// Static scene: no drift, landmark count stable after the first keyframe.
#[test]
fn static_scene_stays_put() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 101);
    let poses = trajectory(TrajectoryPreset::Static { frames: 10 });
    run_sequence(&mut system, &poses, false, |_, _| {});

    assert_eq!(system.state(), TrackingState::Tracking);

    // Trajectory length stays zero.
    let mut length = 0.0;
    let records = system.trajectory();
    for pair in records.windows(2) {
        let dx = pair[1].tx - pair[0].tx;
        let dy = pair[1].ty - pair[0].ty;
        let dz = pair[1].tz - pair[0].tz;
        length += (dx * dx + dy * dy + dz * dz).sqrt();
    }
    assert!(length < 0.01, "trajectory drifted by {length} m");

    // Only the bootstrap keyframe; the landmark counts settle with it.
    assert_eq!(system.keyframes().len(), 1);
    assert!(system.store().plane_count() >= 3);
    assert!(system.store().point_count() > 20);
}

/// Pure translation: +0.5 m along x over 30 frames, walls in view.
#[test]
fn translation_recovers_ground_truth() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 102);
    let poses = trajectory(TrajectoryPreset::TranslateX {
        distance: 0.5,
        frames: 30,
    });
    run_sequence(&mut system, &poses, false, |_, _| {});

    assert_eq!(system.state(), TrackingState::Tracking);
    let truth = *poses.last().unwrap();
    let diff = final_pose(&system).relative_to(&truth);
    assert!(
        diff.translation().norm() < 0.02,
        "final translation error {} m",
        diff.translation().norm()
    );
    assert!(
        diff.rotation_angle() < 1.0_f64.to_radians(),
        "final rotation error {} rad",
        diff.rotation_angle()
    );
}

/// Pure pan: +30 degrees about the camera's vertical axis over 20 frames.
#[test]
fn pan_recovers_ground_truth() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 103);
    let poses = trajectory(TrajectoryPreset::Pan {
        angle: 30.0_f64.to_radians(),
        frames: 20,
    });
    run_sequence(&mut system, &poses, false, |_, _| {});

    assert_eq!(system.state(), TrackingState::Tracking);
    let pose = final_pose(&system);
    let (roll, pitch, yaw) = pose.euler_angles();
    // The pan axis is the camera's y (pitch in euler terms).
    assert!(
        (pitch - 30.0_f64.to_radians()).abs() < 1.0_f64.to_radians(),
        "pan angle error, pitch = {pitch}"
    );
    assert!(roll.abs() < 0.3_f64.to_radians(), "roll leaked: {roll}");
    assert!(yaw.abs() < 0.3_f64.to_radians(), "yaw leaked: {yaw}");
}

/// Losing all plane observations for a few frames must not lose tracking:
/// the point-only stage carries the motion and the graph keeps growing.
#[test]
fn plane_blackout_survives_on_points() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 104);
    let poses = trajectory(TrajectoryPreset::TranslateX {
        distance: 0.3,
        frames: 20,
    });
    run_sequence(&mut system, &poses, false, |i, frame| {
        if (8..13).contains(&i) {
            frame.planes.clear();
        }
    });

    assert_eq!(system.state(), TrackingState::Tracking);
    let truth = *poses.last().unwrap();
    let diff = final_pose(&system).relative_to(&truth);
    assert!(
        diff.translation().norm() < 0.05,
        "final translation error {} m",
        diff.translation().norm()
    );
    assert!(system.keyframes().len() >= 2, "graph stopped growing");
}

/// Losing all keypoints must not lose tracking either: the plane-only stage
/// aligns the frames.
#[test]
fn keypoint_blackout_survives_on_planes() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 105);
    let poses = trajectory(TrajectoryPreset::TranslateX {
        distance: 0.3,
        frames: 20,
    });
    run_sequence(&mut system, &poses, false, |i, frame| {
        if (8..13).contains(&i) {
            frame.keypoints.clear();
            frame.descriptors.clear();
            frame.points.clear();
        }
    });

    assert_eq!(system.state(), TrackingState::Tracking);
    let truth = *poses.last().unwrap();
    let diff = final_pose(&system).relative_to(&truth);
    assert!(
        diff.translation().norm() < 0.05,
        "final translation error {} m",
        diff.translation().norm()
    );
}

/// An ambiguous observation (single plane, too few matches) cannot be
/// tracked. Without odometry the system goes lost; with force_odom the
/// odometry prior keeps the trajectory advancing.
#[test]
fn ambiguous_frame_goes_lost_without_odom() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 106);
    let poses = trajectory(TrajectoryPreset::Static { frames: 3 });
    run_sequence(&mut system, &poses, false, |i, frame| {
        if i == 2 {
            frame.planes.truncate(1);
            frame.keypoints.truncate(2);
            frame.descriptors.truncate(2);
            frame.points.truncate(2);
        }
    });
    assert_eq!(system.state(), TrackingState::Lost);
}

#[test]
fn ambiguous_frame_survives_with_force_odom() {
    let mut config = SlamConfig::default();
    config.force_odom = true;
    let mut system = SlamSystem::with_seed(config, 107);
    let poses = trajectory(TrajectoryPreset::TranslateX {
        distance: 0.2,
        frames: 10,
    });
    run_sequence(&mut system, &poses, true, |i, frame| {
        if (4..7).contains(&i) {
            frame.planes.truncate(1);
            frame.keypoints.truncate(2);
            frame.descriptors.truncate(2);
            frame.points.truncate(2);
        }
    });

    assert_eq!(system.state(), TrackingState::Tracking);
    let truth = *poses.last().unwrap();
    let diff = final_pose(&system).relative_to(&truth);
    assert!(
        diff.translation().norm() < 0.05,
        "final translation error {} m",
        diff.translation().norm()
    );
}

/// With odometry attached, the published map<-odom correction stays small
/// when odometry is perfect.
#[test]
fn map_correction_stays_small_with_perfect_odom() {
    let mut system = SlamSystem::with_seed(SlamConfig::default(), 108);
    let handle = system.map_tf_handle();
    let poses = trajectory(TrajectoryPreset::TranslateX {
        distance: 0.4,
        frames: 15,
    });
    run_sequence(&mut system, &poses, true, |_, _| {});

    let tf = handle.load();
    assert!(tf.x.abs() < 0.02 && tf.y.abs() < 0.02, "correction ({}, {})", tf.x, tf.y);
    assert!(tf.yaw.abs() < 1.0_f64.to_radians());
}

//! Persisted result artifacts: plain-text landmark and path dumps, runtime
//! statistics, the Graphviz graph, and PCD map clouds. Every save request
//! lands in a fresh timestamped directory under the configured root.

use crate::SlamSystem;
use chrono::Local;
use frame::Descriptor;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;
use types::{PoseRecord, Runtime, RuntimeSummary};

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    /// Root directory for result dumps.
    pub artifact_dir: PathBuf,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("./slam-results"),
        }
    }
}

/// Dump all artifacts into a timestamped subdirectory of `root` and return
/// its path. `simple` skips the dense map cloud.
pub fn save_all(system: &SlamSystem, root: &Path, simple: bool) -> Result<PathBuf, ArtifactError> {
    let dir = root.join(Local::now().format("%Y%m%d-%H%M%S").to_string());
    fs::create_dir_all(&dir)?;

    write_plane_landmarks(system, &dir.join("planes.txt"))?;
    write_keypoint_landmarks(system, &dir.join("keypoints.txt"))?;
    write_path_file(&system.graph_path_records(), &dir.join("optimized_path.txt"))?;
    write_path_file(system.odom_path(), &dir.join("odom_path.txt"))?;
    write_path_file(
        system.visual_odometry_path(),
        &dir.join("visual_odometry_path.txt"),
    )?;
    write_runtimes(
        system.runtimes(),
        system.frame_count(),
        &dir.join("runtimes.txt"),
    )?;

    let mut dot = BufWriter::new(File::create(dir.join("graph.dot"))?);
    system.graph().save_dot(&mut dot)?;

    write_pcd(&map_cloud(system), &dir.join("map.pcd"))?;
    write_pcd(&keypoint_cloud(system), &dir.join("map_keypoints.pcd"))?;
    if !simple {
        write_pcd(&dense_cloud(system), &dir.join("map_full.pcd"))?;
    }

    info!(dir = %dir.display(), "saved SLAM result");
    Ok(dir)
}

/// One `a b c d` line per valid plane landmark.
fn write_plane_landmarks(system: &SlamSystem, path: &Path) -> Result<(), ArtifactError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# plane landmarks: ax + by + cz + d = 0")?;
    writeln!(w, "# size {}", system.store().plane_count())?;
    for lm in system.store().valid_planes() {
        let c = lm.plane.coefficients();
        writeln!(w, "{:.6} {:.6} {:.6} {:.6}", c[0], c[1], c[2], c[3])?;
    }
    Ok(())
}

/// Positions (`x y z` per line), then the descriptor dump: 4 groups of
/// 8 bytes per keypoint (32 bytes total), one keypoint per line.
fn write_keypoint_landmarks(system: &SlamSystem, path: &Path) -> Result<(), ArtifactError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# keypoint landmarks: (x, y, z)")?;
    writeln!(w, "# descriptor: 8 bytes per group, 4 groups = 32 bytes")?;
    writeln!(w, "# size {}", system.store().point_count())?;
    writeln!(w, "# location:")?;
    for lm in system.store().valid_points() {
        let p = lm.position;
        writeln!(w, "{:.6} {:.6} {:.6}", p.x, p.y, p.z)?;
    }
    writeln!(w)?;
    writeln!(w, "# descriptor:")?;
    for lm in system.store().valid_points() {
        if let Descriptor::Binary(bytes) = &lm.descriptor {
            for group in bytes.chunks(8) {
                for b in group {
                    write!(w, "{} ", b)?;
                }
            }
            writeln!(w)?;
        }
    }
    Ok(())
}

/// One `tx ty tz qx qy qz qw` record per line.
fn write_path_file(poses: &[PoseRecord], path: &Path) -> Result<(), ArtifactError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# pose format: T(xyz) Q(xyzw)")?;
    writeln!(w, "# poses: {}", poses.len())?;
    for p in poses {
        writeln!(
            w,
            "{:.6} {:.6} {:.6} {:.6} {:.6} {:.6} {:.6}",
            p.tx, p.ty, p.tz, p.qx, p.qy, p.qz, p.qw
        )?;
    }
    Ok(())
}

/// Per-keyframe `frame tracking mapping total` in milliseconds, followed by
/// average / maximum / minimum summary rows.
fn write_runtimes(runtimes: &[Runtime], frame_count: u64, path: &Path) -> Result<(), ArtifactError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# format: frame tracking mapping total (ms)")?;
    writeln!(w, "# frames: {}", frame_count)?;
    writeln!(w, "# keyframes: {}", runtimes.len())?;
    for r in runtimes {
        writeln!(
            w,
            "{:.3} {:.3} {:.3} {:.3}",
            r.frame_ms, r.tracking_ms, r.mapping_ms, r.total_ms
        )?;
    }
    if let Some(summary) = RuntimeSummary::from_samples(runtimes) {
        for (label, r) in [
            ("average", summary.avg),
            ("maximum", summary.max),
            ("minimum", summary.min),
        ] {
            writeln!(w)?;
            writeln!(w, "# {label}:")?;
            writeln!(
                w,
                "{:.3} {:.3} {:.3} {:.3}",
                r.frame_ms, r.tracking_ms, r.mapping_ms, r.total_ms
            )?;
        }
    }
    Ok(())
}

/// ASCII PCD v0.7 with x y z fields.
fn write_pcd(points: &[Point3<f64>], path: &Path) -> Result<(), ArtifactError> {
    let mut w = BufWriter::new(File::create(path)?);
    writeln!(w, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(w, "VERSION 0.7")?;
    writeln!(w, "FIELDS x y z")?;
    writeln!(w, "SIZE 4 4 4")?;
    writeln!(w, "TYPE F F F")?;
    writeln!(w, "COUNT 1 1 1")?;
    writeln!(w, "WIDTH {}", points.len())?;
    writeln!(w, "HEIGHT 1")?;
    writeln!(w, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(w, "POINTS {}", points.len())?;
    writeln!(w, "DATA ascii")?;
    for p in points {
        writeln!(w, "{:.4} {:.4} {:.4}", p.x, p.y, p.z)?;
    }
    Ok(())
}

/// Plane landmark extents: hull corners plus centroid-of-hull points.
fn map_cloud(system: &SlamSystem) -> Vec<Point3<f64>> {
    let mut cloud = Vec::new();
    for lm in system.store().valid_planes() {
        cloud.extend_from_slice(&lm.hull);
    }
    cloud
}

fn keypoint_cloud(system: &SlamSystem) -> Vec<Point3<f64>> {
    system.store().valid_points().map(|lm| lm.position).collect()
}

/// Hull outlines densified along their edges.
fn dense_cloud(system: &SlamSystem) -> Vec<Point3<f64>> {
    let mut cloud = Vec::new();
    for lm in system.store().valid_planes() {
        let hull = &lm.hull;
        cloud.extend_from_slice(hull);
        for i in 0..hull.len() {
            let a = hull[i];
            let b = hull[(i + 1) % hull.len()];
            for k in 1..8 {
                let t = k as f64 / 8.0;
                cloud.push(a + (b - a) * t);
            }
        }
    }
    cloud
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SlamConfig, SlamSystem};
    use frame::Frame;
    use geometry::Transform3D;
    use sim::{GridSegmentor, MarkerExtractor, SimCamera, SimConfig, SimWorld};

    fn populated_system() -> SlamSystem {
        let mut cam = SimCamera::new(SimWorld::room(), SimConfig::default());
        let mut system = SlamSystem::with_seed(SlamConfig::default(), 9);
        for (i, pose) in [
            Transform3D::identity(),
            Transform3D::from_xyz_rpy(0.15, 0.0, 0.0, 0.0, 0.0, 0.0),
        ]
        .iter()
        .enumerate()
        {
            let (rgb, depth) = cam.render(pose);
            let frame = Frame::from_images(
                i as f64 * 0.1,
                i as u64,
                &rgb,
                &depth,
                cam.intrinsics(),
                &MarkerExtractor,
                &GridSegmentor::default(),
            );
            system.process(frame, Some(*pose), 1.0);
        }
        system
    }

    #[test]
    fn save_all_writes_expected_files() {
        let system = populated_system();
        let root = std::env::temp_dir().join(format!("slam-artifacts-{}", std::process::id()));
        let dir = save_all(&system, &root, false).unwrap();

        for name in [
            "planes.txt",
            "keypoints.txt",
            "optimized_path.txt",
            "odom_path.txt",
            "visual_odometry_path.txt",
            "runtimes.txt",
            "graph.dot",
            "map.pcd",
            "map_keypoints.pcd",
            "map_full.pcd",
        ] {
            assert!(dir.join(name).exists(), "missing {name}");
        }

        let planes = fs::read_to_string(dir.join("planes.txt")).unwrap();
        let data_lines: Vec<&str> = planes
            .lines()
            .filter(|l| !l.starts_with('#') && !l.is_empty())
            .collect();
        assert!(!data_lines.is_empty());
        for line in data_lines {
            assert_eq!(line.split_whitespace().count(), 4);
        }

        let pcd = fs::read_to_string(dir.join("map_keypoints.pcd")).unwrap();
        assert!(pcd.contains("VERSION 0.7"));
        assert!(pcd.contains("DATA ascii"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn descriptor_dump_has_32_bytes_per_keypoint() {
        let system = populated_system();
        let root = std::env::temp_dir().join(format!("slam-artifacts-d-{}", std::process::id()));
        let dir = save_all(&system, &root, true).unwrap();
        let text = fs::read_to_string(dir.join("keypoints.txt")).unwrap();
        let mut in_descriptors = false;
        for line in text.lines() {
            if line.starts_with("# descriptor:") {
                in_descriptors = true;
                continue;
            }
            if in_descriptors && !line.is_empty() && !line.starts_with('#') {
                assert_eq!(line.split_whitespace().count(), 32);
            }
        }
        assert!(!dir.join("map_full.pcd").exists(), "simple dump skips the dense cloud");
        fs::remove_dir_all(&root).unwrap();
    }
}

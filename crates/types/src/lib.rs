//! Shared types and identifiers for the arbor SLAM stack.

use serde::{Deserialize, Serialize};

/// Identifier of a keyframe (pose-graph node). Assigned in strict insertion
/// order and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyframeId(pub u64);

impl std::fmt::Display for KeyframeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "x{}", self.0)
    }
}

/// Identifier of a landmark (plane or keypoint). Immutable once assigned;
/// a merged landmark keeps its id with a forwarding pointer to the survivor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LandmarkId(pub u64);

impl std::fmt::Display for LandmarkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// A pose record for path output: translation + unit quaternion (xyzw).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PoseRecord {
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub qw: f64,
}

/// Per-keyframe processing times in milliseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Runtime {
    pub frame_ms: f64,
    pub tracking_ms: f64,
    pub mapping_ms: f64,
    pub total_ms: f64,
}

impl Runtime {
    pub fn new(frame_ms: f64, tracking_ms: f64, mapping_ms: f64) -> Self {
        Self {
            frame_ms,
            tracking_ms,
            mapping_ms,
            total_ms: frame_ms + tracking_ms + mapping_ms,
        }
    }

    fn fold(&self, other: &Runtime, f: impl Fn(f64, f64) -> f64) -> Runtime {
        Runtime {
            frame_ms: f(self.frame_ms, other.frame_ms),
            tracking_ms: f(self.tracking_ms, other.tracking_ms),
            mapping_ms: f(self.mapping_ms, other.mapping_ms),
            total_ms: f(self.total_ms, other.total_ms),
        }
    }

    pub fn max(&self, other: &Runtime) -> Runtime {
        self.fold(other, f64::max)
    }

    pub fn min(&self, other: &Runtime) -> Runtime {
        self.fold(other, f64::min)
    }

    pub fn add(&self, other: &Runtime) -> Runtime {
        self.fold(other, |a, b| a + b)
    }

    pub fn scale(&self, k: f64) -> Runtime {
        Runtime {
            frame_ms: self.frame_ms * k,
            tracking_ms: self.tracking_ms * k,
            mapping_ms: self.mapping_ms * k,
            total_ms: self.total_ms * k,
        }
    }
}

/// Aggregate over all recorded keyframe runtimes.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeSummary {
    pub avg: Runtime,
    pub max: Runtime,
    pub min: Runtime,
    pub count: usize,
}

impl RuntimeSummary {
    pub fn from_samples(samples: &[Runtime]) -> Option<Self> {
        let first = samples.first()?;
        let mut sum = *first;
        let mut max = *first;
        let mut min = *first;
        for r in &samples[1..] {
            sum = sum.add(r);
            max = max.max(r);
            min = min.min(r);
        }
        Some(Self {
            avg: sum.scale(1.0 / samples.len() as f64),
            max,
            min,
            count: samples.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_summary() {
        let samples = [
            Runtime::new(10.0, 20.0, 30.0),
            Runtime::new(20.0, 10.0, 10.0),
        ];
        let summary = RuntimeSummary::from_samples(&samples).unwrap();
        assert_eq!(summary.count, 2);
        assert!((summary.avg.frame_ms - 15.0).abs() < 1e-9);
        assert!((summary.max.tracking_ms - 20.0).abs() < 1e-9);
        assert!((summary.min.mapping_ms - 10.0).abs() < 1e-9);
        assert!((summary.avg.total_ms - 50.0).abs() < 1e-9);
    }

    #[test]
    fn runtime_summary_empty() {
        assert!(RuntimeSummary::from_samples(&[]).is_none());
    }
}

//! Frame-to-frame motion estimation.
//!
//! Provides:
//! - Descriptor matching with inlier scoring under a candidate transform
//! - Closed-form rigid alignment from points, planes, or mixed constraints
//! - ICP and RANSAC PnP fallbacks
//! - The cascade estimator that selects among them per frame
//!
//! The estimator returns an explicit outcome per stage; stage failures are
//! silent below it and surface as a single "tracking lost" event.

mod estimator;
pub mod icp;
pub mod matcher;
pub mod pnp;
pub mod solvers;

pub use estimator::{plane_pairs, PlanePair, RelativeMotion, Tracker, TrackingConfig};
pub use icp::IcpConfig;
pub use matcher::{correspondence_inliers, match_features, Match, MatcherConfig};
pub use pnp::PnpConfig;
pub use solvers::{solve_rt_mixed, solve_rt_planes, solve_rt_points, MotionEstimate};

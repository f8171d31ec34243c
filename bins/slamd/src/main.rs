//! slamd — RGB-D plane SLAM daemon.
//!
//! Sensor transport binding is deployment-specific; the built-in frontend
//! replays a simulated room sequence (`--sim`), which exercises the whole
//! pipeline: frame construction, tracking, mapping, graph updates, the
//! map<-odom publisher, and artifact dumps.

use anyhow::{bail, Result};
use clap::Parser;
use serde::Deserialize;
use sim::{trajectory, GridSegmentor, MarkerExtractor, SimCamera, SimConfig, SimWorld,
    TrajectoryPreset};
use slam::artifacts::{self, ArtifactConfig};
use slam::pipeline::{self, PipelineConfig, SensorMessage};
use slam::tf::{spawn_publisher, TfConfig};
use slam::{SlamConfig, SlamSystem};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Configuration file structure (slam.toml).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    frontend: FrontendConfig,
    slam: SlamConfig,
    pipeline: PipelineConfig,
    tf: TfConfig,
    artifacts: ArtifactConfig,
}

/// Sensor-frontend capability selection. The sim frontend provides the
/// organized segmentor and an ORB-like extractor; other variants come with
/// the deployment's sensor binding.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FrontendConfig {
    keypoint_type: frame::KeypointKind,
    plane_segment_method: frame::SegmentMethod,
}

impl FileConfig {
    fn load(path: &std::path::Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: FileConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            warn!(path = %path.display(), "Config file not found, using defaults");
            Ok(FileConfig::default())
        }
    }
}

#[derive(Parser)]
#[command(name = "slamd", about = "RGB-D plane SLAM daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/slam.toml")]
    config: PathBuf,

    /// Run the simulated room frontend (no sensor transport is built in)
    #[arg(long)]
    sim: bool,

    /// Sim motion preset: static, translate, or pan
    #[arg(long, default_value = "translate")]
    sim_motion: String,

    /// Number of simulated frames
    #[arg(long, default_value = "30")]
    sim_frames: usize,

    /// Translation distance for the translate preset (meters)
    #[arg(long, default_value = "0.5")]
    sim_distance: f64,

    /// Pan angle for the pan preset (degrees)
    #[arg(long, default_value = "30.0")]
    sim_angle_deg: f64,

    /// Attach ground-truth odometry poses to the simulated frames
    #[arg(long)]
    sim_odom: bool,

    /// Frame rate of the simulated feed (Hz)
    #[arg(long, default_value = "10.0")]
    rate_hz: f64,

    /// Seed for deterministic RANSAC
    #[arg(long)]
    seed: Option<u64>,

    /// Process every n-th message (overrides config file)
    #[arg(long)]
    skip_message: Option<u64>,

    /// Substitute the odometry prior when tracking fails (overrides config)
    #[arg(long)]
    force_odom: bool,

    /// Bypass the tracker and integrate odometry (overrides config)
    #[arg(long)]
    use_odom_tracking: bool,

    /// Artifact output root (overrides config file)
    #[arg(long)]
    artifact_dir: Option<PathBuf>,

    /// Dump all artifacts when the feed ends
    #[arg(long)]
    save_on_exit: bool,

    /// Log directory for text logs
    #[arg(long, default_value = "./logs")]
    log_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The guard must be held for the lifetime of the program so logs flush.
    let _log_guard = init_logging(&args.log_dir, &args.log_level)?;

    let mut file_config = FileConfig::load(&args.config)?;
    info!(path = %args.config.display(), "Loaded config");

    // CLI overrides.
    if let Some(skip) = args.skip_message {
        file_config.pipeline.skip_message = skip;
    }
    if args.force_odom {
        file_config.slam.force_odom = true;
    }
    if args.use_odom_tracking {
        file_config.slam.use_odom_tracking = true;
    }
    if let Some(dir) = &args.artifact_dir {
        file_config.artifacts.artifact_dir = dir.clone();
    }

    if !args.sim {
        bail!("no sensor frontend configured; run with --sim or bind a transport");
    }
    if file_config.frontend.keypoint_type != frame::KeypointKind::Orb
        || file_config.frontend.plane_segment_method != frame::SegmentMethod::Organized
    {
        warn!(
            keypoint_type = ?file_config.frontend.keypoint_type,
            plane_segment_method = ?file_config.frontend.plane_segment_method,
            "sim frontend only provides ORB-like markers and the organized segmentor"
        );
    }

    let preset = match args.sim_motion.as_str() {
        "static" => TrajectoryPreset::Static {
            frames: args.sim_frames,
        },
        "translate" => TrajectoryPreset::TranslateX {
            distance: args.sim_distance,
            frames: args.sim_frames,
        },
        "pan" => TrajectoryPreset::Pan {
            angle: args.sim_angle_deg.to_radians(),
            frames: args.sim_frames,
        },
        other => bail!("unknown sim motion preset: {other}"),
    };

    let system = match args.seed {
        Some(seed) => SlamSystem::with_seed(file_config.slam.clone(), seed),
        None => SlamSystem::new(file_config.slam.clone()),
    };

    // map<-odom publisher; log the broadcast at debug level.
    let (mut tf_rx, tf_task) = spawn_publisher(system.map_tf_handle(), file_config.tf.clone());
    tokio::spawn(async move {
        while tf_rx.changed().await.is_ok() {
            let msg = tf_rx.borrow().clone();
            debug!(
                parent = %msg.parent,
                child = %msg.child,
                x = msg.transform.x,
                y = msg.transform.y,
                yaw = msg.transform.yaw,
                "map tf"
            );
        }
    });

    let mut handle = pipeline::spawn(
        system,
        Arc::new(MarkerExtractor),
        Arc::new(GridSegmentor::default()),
        file_config.pipeline.clone(),
        file_config.artifacts.clone(),
    );

    // Report per-frame outcomes as they come back.
    let mut outcome_rx =
        std::mem::replace(&mut handle.outcomes, tokio::sync::mpsc::unbounded_channel().1);
    let reporter = tokio::spawn(async move {
        while let Some(outcome) = outcome_rx.recv().await {
            if outcome.keyframe {
                info!(
                    seq = outcome.seq,
                    inliers = outcome.inliers,
                    rmse = outcome.rmse,
                    provisional = outcome.provisional,
                    "keyframe"
                );
            } else {
                debug!(seq = outcome.seq, state = ?outcome.state, "frame processed");
            }
        }
    });

    info!(
        preset = %args.sim_motion,
        frames = args.sim_frames,
        rate_hz = args.rate_hz,
        "Starting simulated feed"
    );
    let mut cam = SimCamera::new(SimWorld::room(), SimConfig::default());
    let period = Duration::from_secs_f64(1.0 / args.rate_hz.max(0.1));
    let mut ticker = tokio::time::interval(period);
    for (i, pose) in trajectory(preset).iter().enumerate() {
        ticker.tick().await;
        let (rgb, depth) = cam.render(pose);
        let message = SensorMessage {
            stamp: i as f64 * period.as_secs_f64(),
            seq: i as u64,
            rgb,
            depth,
            intrinsics: cam.intrinsics(),
            odom: args.sim_odom.then_some(*pose),
        };
        handle.push(message).await?;
    }

    let system = handle.finish().await;
    let _ = reporter.await;
    tf_task.abort();

    info!(
        frames = system.frame_count(),
        keyframes = system.keyframes().len(),
        planes = system.store().plane_count(),
        points = system.store().point_count(),
        "Feed complete"
    );
    if let Some(pose) = system.current_pose() {
        let t = pose.translation();
        info!(x = t.x, y = t.y, z = t.z, "Final pose");
    }

    if args.save_on_exit {
        let dir = artifacts::save_all(&system, &file_config.artifacts.artifact_dir, false)?;
        info!(dir = %dir.display(), "Artifacts saved");
    }

    Ok(())
}

/// Initialize logging with stdout and rolling file output.
fn init_logging(
    log_dir: &std::path::Path,
    level: &str,
) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, "slamd.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("slamd={level},slam={level},tracking={level}")));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    Ok(guard)
}

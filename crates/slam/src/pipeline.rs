//! Sensor ingest pipeline.
//!
//! A bounded queue feeds a small worker pool that constructs Frames
//! concurrently; a resequencer restores arrival order and drives the core
//! synchronously, so the back-end always sees frames (and keyframes) in
//! strictly monotonic order. Backpressure is a modulo skip policy at the
//! queue head rather than unbounded buffering.

use crate::artifacts::{self, ArtifactConfig, ArtifactError};
use crate::{FrameOutcome, SlamSystem};
use frame::{DepthImage, FeatureExtractor, Frame, Intrinsics, PlaneSegmentor, RgbImage};
use geometry::Transform3D;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline is shut down")]
    Closed,
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded ingest queue size.
    pub queue_size: usize,
    /// Frame-construction workers.
    pub workers: usize,
    /// Process every n-th message; the rest are dropped at the queue head.
    pub skip_message: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_size: 8,
            workers: 6,
            skip_message: 1,
        }
    }
}

/// One sensor event: RGB + depth + intrinsics, with an optional odometry
/// pose sampled at the sensor timestamp.
pub struct SensorMessage {
    pub stamp: f64,
    pub seq: u64,
    pub rgb: RgbImage,
    pub depth: DepthImage,
    pub intrinsics: Intrinsics,
    pub odom: Option<Transform3D>,
}

/// Requests served by the core between frames.
pub enum SlamRequest {
    /// Dump all artifacts; replies with the created directory.
    SaveResult {
        simple: bool,
        reply: oneshot::Sender<Result<PathBuf, ArtifactError>>,
    },
}

/// Handle to a running pipeline.
pub struct PipelineHandle {
    sensor_tx: mpsc::Sender<SensorMessage>,
    request_tx: mpsc::Sender<SlamRequest>,
    pub outcomes: mpsc::UnboundedReceiver<FrameOutcome>,
    core: JoinHandle<SlamSystem>,
}

impl PipelineHandle {
    /// Enqueue a sensor message, waiting for queue space.
    pub async fn push(&self, message: SensorMessage) -> Result<(), PipelineError> {
        self.sensor_tx
            .send(message)
            .await
            .map_err(|_| PipelineError::Closed)
    }

    /// Request an artifact dump and wait for the directory.
    pub async fn save_result(&self, simple: bool) -> Result<PathBuf, PipelineError> {
        let (reply, rx) = oneshot::channel();
        self.request_tx
            .send(SlamRequest::SaveResult { simple, reply })
            .await
            .map_err(|_| PipelineError::Closed)?;
        Ok(rx.await.map_err(|_| PipelineError::Closed)??)
    }

    /// Close the intake and wait for all queued frames to drain, returning
    /// the system for inspection.
    pub async fn finish(self) -> SlamSystem {
        drop(self.sensor_tx);
        drop(self.request_tx);
        self.core.await.expect("core task panicked")
    }
}

struct BuiltFrame {
    ticket: u64,
    frame: Frame,
    odom: Option<Transform3D>,
    build_ms: f64,
}

/// Spawn the ingest pipeline around a [`SlamSystem`].
pub fn spawn(
    system: SlamSystem,
    extractor: Arc<dyn FeatureExtractor>,
    segmentor: Arc<dyn PlaneSegmentor>,
    config: PipelineConfig,
    artifact_config: ArtifactConfig,
) -> PipelineHandle {
    let workers = config.workers.max(1);
    let (sensor_tx, mut sensor_rx) = mpsc::channel::<SensorMessage>(config.queue_size.max(1));
    let (request_tx, mut request_rx) = mpsc::channel::<SlamRequest>(4);
    let (outcome_tx, outcomes) = mpsc::unbounded_channel();
    let (built_tx, mut built_rx) = mpsc::channel::<BuiltFrame>(workers * 2);

    // Dispatcher: skip policy + round-robin fan-out to the workers.
    let mut worker_txs = Vec::with_capacity(workers);
    for worker in 0..workers {
        let (tx, mut rx) = mpsc::channel::<(u64, SensorMessage)>(2);
        worker_txs.push(tx);
        let extractor = extractor.clone();
        let segmentor = segmentor.clone();
        let built_tx = built_tx.clone();
        tokio::spawn(async move {
            while let Some((ticket, msg)) = rx.recv().await {
                let start = Instant::now();
                let frame = Frame::from_images(
                    msg.stamp,
                    msg.seq,
                    &msg.rgb,
                    &msg.depth,
                    msg.intrinsics,
                    extractor.as_ref(),
                    segmentor.as_ref(),
                );
                let built = BuiltFrame {
                    ticket,
                    frame,
                    odom: msg.odom,
                    build_ms: start.elapsed().as_secs_f64() * 1e3,
                };
                if built_tx.send(built).await.is_err() {
                    break;
                }
            }
            debug!(worker, "frame worker stopped");
        });
    }
    drop(built_tx);

    let skip = config.skip_message.max(1);
    tokio::spawn(async move {
        let mut counter = 0u64;
        let mut ticket = 0u64;
        let mut next_worker = 0usize;
        while let Some(msg) = sensor_rx.recv().await {
            counter += 1;
            if (counter - 1) % skip != 0 {
                debug!(seq = msg.seq, "skip message");
                continue;
            }
            if worker_txs[next_worker].send((ticket, msg)).await.is_err() {
                break;
            }
            ticket += 1;
            next_worker = (next_worker + 1) % worker_txs.len();
        }
        debug!("dispatcher stopped");
    });

    // Core: resequence by ticket, process in order, serve requests between
    // frames.
    let core = tokio::spawn(async move {
        let mut system = system;
        let mut pending: BTreeMap<u64, BuiltFrame> = BTreeMap::new();
        let mut next_ticket = 0u64;
        let mut built_open = true;
        let mut requests_open = true;
        while built_open || !pending.is_empty() {
            tokio::select! {
                built = built_rx.recv(), if built_open => {
                    match built {
                        Some(b) => { pending.insert(b.ticket, b); }
                        None => built_open = false,
                    }
                }
                request = request_rx.recv(), if requests_open => {
                    match request {
                        Some(SlamRequest::SaveResult { simple, reply }) => {
                            let result = artifacts::save_all(
                                &system,
                                &artifact_config.artifact_dir,
                                simple,
                            );
                            if let Err(e) = &result {
                                error!(?e, "failed to save artifacts");
                            }
                            let _ = reply.send(result);
                        }
                        None => requests_open = false,
                    }
                }
            }
            while let Some(built) = pending.remove(&next_ticket) {
                next_ticket += 1;
                let outcome = system.process(built.frame, built.odom, built.build_ms);
                let _ = outcome_tx.send(outcome);
            }
        }
        info!(frames = system.frame_count(), "pipeline drained");
        system
    });

    PipelineHandle {
        sensor_tx,
        request_tx,
        outcomes,
        core,
    }
}

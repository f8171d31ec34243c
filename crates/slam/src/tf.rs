//! The map<-odom transform handoff.
//!
//! The tracker writes the planar correction after each frame; a
//! low-frequency publisher task reads it. The single shared value sits
//! behind a mutex and each critical section is one load or store.

use geometry::PlanarTransform;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TfConfig {
    pub map_frame: String,
    pub base_frame: String,
    pub odom_frame: String,
    /// Publish frequency for map<-odom, Hz.
    pub map_tf_freq: f64,
    pub publish_map_tf: bool,
}

impl Default for TfConfig {
    fn default() -> Self {
        Self {
            map_frame: "map".to_string(),
            base_frame: "base_link".to_string(),
            odom_frame: "odom".to_string(),
            map_tf_freq: 50.0,
            publish_map_tf: true,
        }
    }
}

/// Shared slot for the latest map<-odom correction.
#[derive(Debug, Clone, Default)]
pub struct MapTfHandle {
    inner: Arc<Mutex<PlanarTransform>>,
}

impl MapTfHandle {
    pub fn store(&self, transform: PlanarTransform) {
        *self.inner.lock().expect("map tf mutex poisoned") = transform;
    }

    pub fn load(&self) -> PlanarTransform {
        *self.inner.lock().expect("map tf mutex poisoned")
    }
}

/// A stamped map<-odom broadcast.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StampedMapTf {
    /// Seconds since the Unix epoch.
    pub stamp: f64,
    pub parent: String,
    pub child: String,
    pub transform: PlanarTransform,
}

/// Spawn the publisher task. Consumers subscribe to the returned watch
/// channel; dropping all receivers stops the task.
pub fn spawn_publisher(
    handle: MapTfHandle,
    config: TfConfig,
) -> (watch::Receiver<StampedMapTf>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(StampedMapTf::default());
    let period = Duration::from_secs_f64(1.0 / config.map_tf_freq.max(1e-3));
    let task = tokio::spawn(async move {
        if !config.publish_map_tf {
            return;
        }
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            let stamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or_default();
            let msg = StampedMapTf {
                stamp,
                parent: config.map_frame.clone(),
                child: config.odom_frame.clone(),
                transform: handle.load(),
            };
            if tx.send(msg).is_err() {
                debug!("map tf publisher stopping, no subscribers");
                break;
            }
        }
    });
    (rx, task)
}

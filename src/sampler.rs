use crate::connection::DeviceHandle;
use crate::coordinates::TrackerCoordinates;
use crate::session::{self, SessionStore};
use crate::worker::{self, CancelHandle, CancelToken};
use crate::{NavError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Consecutive failed reads after which the buffer is marked lost.
const LOST_AFTER_FAILURES: u32 = 3;

pub const DEFAULT_COORDINATE_SAMPLES: usize = 1;
pub const DEFAULT_CALIBRATION_SAMPLES: usize = 10;
pub const DEFAULT_SLEEP_COORD: Duration = Duration::from_millis(100);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Session config key holding [`SamplingSettings`].
pub const SAMPLING_CONFIG_KEY: &str = "tracker_sampling";

/// Sample counts and timing shared by the tracker and its sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingConfig {
    /// Snapshots per routine coordinate query.
    pub coordinate_samples: usize,
    /// Snapshots per fiducial acquisition.
    pub calibration_samples: usize,
    /// Pause between device reads.
    pub sleep_coord: Duration,
    /// Bound on waiting for a worker to exit.
    pub join_timeout: Duration,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            coordinate_samples: DEFAULT_COORDINATE_SAMPLES,
            calibration_samples: DEFAULT_CALIBRATION_SAMPLES,
            sleep_coord: DEFAULT_SLEEP_COORD,
            join_timeout: DEFAULT_JOIN_TIMEOUT,
        }
    }
}

/// Persisted form of [`SamplingConfig`]. Missing fields keep their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinate_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_samples: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_coord_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_timeout_ms: Option<u64>,
}

impl SamplingConfig {
    /// Read from the session config, then apply `NEURONAV_SLEEP_COORD_MS` and
    /// `NEURONAV_CALIBRATION_SAMPLES` overrides.
    pub fn load(session: &dyn SessionStore) -> Self {
        let settings = session
            .get_config(SAMPLING_CONFIG_KEY)
            .and_then(|value| match serde_json::from_value::<SamplingSettings>(value) {
                Ok(settings) => Some(settings),
                Err(e) => {
                    log::warn!("Ignoring malformed {} config: {}", SAMPLING_CONFIG_KEY, e);
                    None
                }
            })
            .unwrap_or_default();

        let defaults = Self::default();
        let mut config = Self {
            coordinate_samples: settings
                .coordinate_samples
                .unwrap_or(defaults.coordinate_samples),
            calibration_samples: settings
                .calibration_samples
                .unwrap_or(defaults.calibration_samples),
            sleep_coord: settings
                .sleep_coord_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.sleep_coord),
            join_timeout: settings
                .join_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.join_timeout),
        };

        if let Some(ms) = session::read_env_u64("NEURONAV_SLEEP_COORD_MS") {
            config.sleep_coord = Duration::from_millis(ms);
        }
        if let Some(n) = session::read_env_usize("NEURONAV_CALIBRATION_SAMPLES") {
            config.calibration_samples = n;
        }
        config.coordinate_samples = config.coordinate_samples.max(1);
        config.calibration_samples = config.calibration_samples.max(1);
        config
    }
}

/// Background reader that keeps [`TrackerCoordinates`] current.
///
/// Owns its thread; dropping the sampler cancels and joins it.
pub struct CoordinateSampler {
    cancel: CancelHandle,
    thread: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl CoordinateSampler {
    pub fn start(
        handle: DeviceHandle,
        coordinates: Arc<TrackerCoordinates>,
        config: &SamplingConfig,
    ) -> Result<CoordinateSampler> {
        let (cancel, token) = worker::cancellation();
        let sleep = config.sleep_coord;

        let thread = std::thread::Builder::new()
            .name("neuronav-sampler".into())
            .spawn(move || {
                sampler_loop(handle, coordinates, token, sleep);
            })
            .map_err(|e| NavError::State(format!("Failed to spawn sampler thread: {}", e)))?;

        Ok(CoordinateSampler {
            cancel,
            thread: Some(thread),
            join_timeout: config.join_timeout,
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait (bounded) for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            worker::join_with_timeout(thread, self.join_timeout);
        }
    }
}

impl Drop for CoordinateSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn sampler_loop(
    handle: DeviceHandle,
    coordinates: Arc<TrackerCoordinates>,
    token: CancelToken,
    sleep: Duration,
) {
    let mut failures = 0u32;
    log::info!("Coordinate sampler started");

    loop {
        if token.is_cancelled() {
            break;
        }

        match handle.read_frame() {
            Ok(frame) => {
                failures = 0;
                coordinates.publish(frame);
            }
            Err(e) => {
                failures += 1;
                if failures == 1 {
                    log::warn!("Tracker read failed: {}", e);
                } else {
                    log::debug!("Tracker read failed ({} in a row): {}", failures, e);
                }
                if failures == LOST_AFTER_FAILURES {
                    coordinates.mark_lost();
                }
            }
        }

        if token.sleep(sleep) {
            break;
        }
    }

    log::info!("Coordinate sampler stopped");
}

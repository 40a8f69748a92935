//! Session coordinator for the active tracking device.
//!
//! Owns at most one connected [`Connection`], the sampler feeding
//! [`TrackerCoordinates`], and the three tracker-space fiducials used for
//! image registration. State is persisted under the `tracker` session key.

use crate::connection::{create_connection, Collaborators, Connection, TrackerConnection};
use crate::coordinates::{LinkState, PoseFeed, Snapshot, TrackerCoordinates};
use crate::sampler::{CoordinateSampler, SamplingConfig};
use crate::session::SessionStore;
use crate::transform::{self, matrix_from_rows, matrix_to_rows};
use crate::types::{Configuration, DeviceKind, LibMode, RawPoseSample, RefMode, PROBE, REFERENCE};
use crate::{NavError, Result};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const TRACKER_STATE_KEY: &str = "tracker";
pub const FIDUCIAL_COUNT: usize = 3;

/// Three landmarks in tracker space plus the dual-body samples they were taken from.
#[derive(Debug, Clone, PartialEq)]
pub struct FiducialSet {
    /// Probe position per fiducial; NaN while unset.
    pub coords: [[f64; 3]; FIDUCIAL_COUNT],
    /// Rows 2i and 2i+1 hold probe and reference samples for fiducial i.
    pub raw: [[f64; 6]; 2 * FIDUCIAL_COUNT],
    /// Tracker-space transform of each raw row.
    pub matrices: [Matrix4<f64>; 2 * FIDUCIAL_COUNT],
}

impl Default for FiducialSet {
    fn default() -> Self {
        Self {
            coords: [[f64::NAN; 3]; FIDUCIAL_COUNT],
            raw: [[0.0; 6]; 2 * FIDUCIAL_COUNT],
            matrices: [Matrix4::zeros(); 2 * FIDUCIAL_COUNT],
        }
    }
}

impl FiducialSet {
    pub fn is_set(&self, index: usize) -> bool {
        self.coords
            .get(index)
            .is_some_and(|row| row.iter().all(|v| !v.is_nan()))
    }

    pub fn all_set(&self) -> bool {
        (0..FIDUCIAL_COUNT).all(|i| self.is_set(i))
    }

    pub fn reset_coords(&mut self) {
        self.coords = [[f64::NAN; 3]; FIDUCIAL_COUNT];
    }
}

/// Median of several buffer snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerReading {
    /// Per-body visibility of the last snapshot taken.
    pub visibilities: Vec<bool>,
    /// Probe pose: z-flipped in static mode, relative to the reference in dynamic mode.
    pub coord: [f64; 6],
    /// Per-body poses.
    pub raw: Vec<[f64; 6]>,
    pub link: LinkState,
}

impl TrackerReading {
    pub fn probe_visible(&self) -> bool {
        self.visibilities.get(PROBE).copied().unwrap_or(false)
    }

    pub fn head_visible(&self) -> bool {
        self.visibilities.get(REFERENCE).copied().unwrap_or(false)
    }
}

/// Session record. NaN fiducial entries are stored as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrackerState {
    tracker_id: u8,
    tracker_fiducials: [[Option<f64>; 3]; FIDUCIAL_COUNT],
    tracker_fiducials_raw: [[f64; 6]; 2 * FIDUCIAL_COUNT],
    marker_tracker_fiducials_raw: [[[f64; 4]; 4]; 2 * FIDUCIAL_COUNT],
    configuration: Option<Configuration>,
}

pub struct Tracker {
    session: Arc<dyn SessionStore>,
    collab: Collaborators,
    config: SamplingConfig,
    n_coils: usize,
    tracker_id: Option<DeviceKind>,
    connection: Option<Connection>,
    sampler: Option<CoordinateSampler>,
    coordinates: Arc<TrackerCoordinates>,
    feed: Arc<dyn PoseFeed>,
    fiducials: FiducialSet,
    connected: bool,
}

impl Tracker {
    pub fn new(session: Arc<dyn SessionStore>, collab: Collaborators) -> Self {
        let config = SamplingConfig::load(session.as_ref());
        let coordinates = Arc::new(TrackerCoordinates::new());
        Self {
            session,
            collab,
            config,
            n_coils: 1,
            tracker_id: None,
            connection: None,
            sampler: None,
            feed: coordinates.clone(),
            coordinates,
            fiducials: FiducialSet::default(),
            connected: false,
        }
    }

    pub fn sampling_config(&self) -> &SamplingConfig {
        &self.config
    }

    pub fn set_sampling_config(&mut self, config: SamplingConfig) {
        self.config = config;
    }

    /// Number of coils tracked in addition to probe and reference. Applies from the
    /// next `set_tracker`.
    pub fn set_coil_count(&mut self, n_coils: usize) {
        self.n_coils = n_coils.max(1);
    }

    /// Buffer written by the sampler.
    pub fn coordinates(&self) -> Arc<TrackerCoordinates> {
        self.coordinates.clone()
    }

    /// Read poses from another source (a recording, a replay) instead of the sampler buffer.
    pub fn set_pose_feed(&mut self, feed: Arc<dyn PoseFeed>) {
        self.feed = feed;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.feed.snapshot()
    }

    /// Replace the active tracker.
    ///
    /// A given `configuration` is replayed without prompting; otherwise the connection
    /// runs its own configure step. The state is saved whether or not the device connects.
    pub fn set_tracker(
        &mut self,
        kind: DeviceKind,
        configuration: Option<Configuration>,
    ) -> Result<()> {
        self.teardown();

        let mut connection = create_connection(kind, self.n_coils, &self.collab);
        let configured = match configuration {
            Some(configuration) => {
                connection.set_configuration(Some(configuration));
                true
            }
            None => connection.configure(),
        };
        if !configured {
            return Err(NavError::Configuration(format!("{} configuration cancelled", kind)));
        }

        connection.connect();
        let result = if connection.is_connected() {
            match connection.connection() {
                Some(handle) => {
                    let sampler =
                        CoordinateSampler::start(handle, self.coordinates.clone(), &self.config)?;
                    self.sampler = Some(sampler);
                    self.tracker_id = Some(kind);
                    self.connected = true;
                    log::info!("Tracker {} ready ({})", kind, connection.lib_mode());
                    Ok(())
                }
                None => Err(NavError::Connection {
                    kind,
                    lib_mode: connection.lib_mode(),
                }),
            }
        } else {
            Err(NavError::Connection {
                kind,
                lib_mode: connection.lib_mode(),
            })
        };

        if let Err(e) = &result {
            log::warn!("Tracker not connected: {}", e);
            self.tracker_id = None;
            self.connected = false;
        }
        self.connection = Some(connection);
        self.save_state()?;
        result
    }

    /// Stop the sampler, release the device and forget the fiducials.
    pub fn disconnect_tracker(&mut self) {
        if !self.connected {
            return;
        }
        self.teardown();
        self.fiducials = FiducialSet::default();
    }

    /// Cancel and join the sampler before the connection is closed.
    fn teardown(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.stop();
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.disconnect();
            if connection.is_connected() {
                log::warn!("Tracker still connected after disconnect");
            } else {
                log::info!("Tracker disconnected");
            }
        }
        self.connection = None;
        self.connected = false;
        self.tracker_id = None;
        self.coordinates.clear();
    }

    /// Median over `n_samples` snapshots of the shared buffer. Never touches hardware.
    pub fn get_tracker_coordinates(&self, ref_mode: RefMode, n_samples: usize) -> TrackerReading {
        let n_samples = n_samples.max(1);
        let mut coords = Vec::with_capacity(n_samples);
        let mut raws: Vec<Vec<[f64; 6]>> = Vec::with_capacity(n_samples);
        let mut last = Snapshot::default();

        for _ in 0..n_samples {
            let snapshot = self.feed.snapshot();
            let frame = &snapshot.frame;
            let mut raw: Vec<[f64; 6]> = frame.bodies.iter().map(RawPoseSample::to_array).collect();

            let coord = match ref_mode {
                RefMode::Dynamic => {
                    transform::dynamic_reference(&frame.body(PROBE), &frame.body(REFERENCE))
                }
                RefMode::Static => {
                    // Image preview convention; raw row 0 is reported flipped as well.
                    raw[PROBE][2] = -raw[PROBE][2];
                    raw[PROBE]
                }
            };
            coords.push(coord);
            raws.push(raw);
            last = snapshot;
        }

        let n_bodies = raws.iter().map(Vec::len).min().unwrap_or(0);
        let raw = (0..n_bodies)
            .map(|b| {
                let column: Vec<[f64; 6]> = raws.iter().map(|r| r[b]).collect();
                transform::median_rows(&column)
            })
            .collect();

        TrackerReading {
            visibilities: last.visibilities(),
            coord: transform::median_rows(&coords),
            raw,
            link: last.link,
        }
    }

    /// Routine query using the configured sample count.
    pub fn current_coordinates(&self, ref_mode: RefMode) -> TrackerReading {
        self.get_tracker_coordinates(ref_mode, self.config.coordinate_samples)
    }

    /// Sample the probe at a landmark and store it as fiducial `index`.
    pub fn set_tracker_fiducial(&mut self, ref_mode: RefMode, index: usize) -> Result<()> {
        if index >= FIDUCIAL_COUNT {
            return Err(NavError::FiducialIndex(index));
        }
        if !self.connected {
            return Err(NavError::State("no tracker connected".into()));
        }

        let reading = self.get_tracker_coordinates(ref_mode, self.config.calibration_samples);
        if !reading.probe_visible() {
            return Err(NavError::MarkerNotVisible("probe"));
        }
        if !reading.head_visible() {
            return Err(NavError::MarkerNotVisible("head"));
        }

        self.fiducials.coords[index] = [reading.coord[0], reading.coord[1], reading.coord[2]];
        for (slot, body) in [(2 * index, PROBE), (2 * index + 1, REFERENCE)] {
            let row = reading.raw[body];
            self.fiducials.raw[slot] = row;
            self.fiducials.matrices[slot] =
                transform::marker_transformation(&RawPoseSample::from_array(row, true));
        }
        log::info!(
            "Set tracker fiducial {} to {:?}",
            index,
            self.fiducials.coords[index]
        );
        self.save_state()
    }

    pub fn reset_tracker_fiducials(&mut self) -> Result<()> {
        self.fiducials.reset_coords();
        self.save_state()
    }

    pub fn get_tracker_fiducials(
        &self,
    ) -> (&[[f64; 3]; FIDUCIAL_COUNT], &[[f64; 6]; 2 * FIDUCIAL_COUNT]) {
        (&self.fiducials.coords, &self.fiducials.raw)
    }

    pub fn fiducials(&self) -> &FiducialSet {
        &self.fiducials
    }

    /// Fiducial coordinate for display, 0 while unset.
    pub fn tracker_fiducial_for_ui(&self, index: usize, coordinate: usize) -> f64 {
        let value = self
            .fiducials
            .coords
            .get(index)
            .and_then(|row| row.get(coordinate))
            .copied()
            .unwrap_or(f64::NAN);
        if value.is_nan() {
            0.0
        } else {
            value
        }
    }

    /// Probe pose relative to the reference body at each fiducial: inv(M_ref) * M_probe.
    pub fn get_matrix_tracker_fiducials(&self) -> [Matrix4<f64>; FIDUCIAL_COUNT] {
        let m = &self.fiducials.matrices;
        std::array::from_fn(|i| transform::rigid_inverse(&m[2 * i + 1]) * m[2 * i])
    }

    pub fn is_tracker_initialized(&self) -> bool {
        self.connection.is_some() && self.tracker_id.is_some() && self.connected
    }

    pub fn is_tracker_fiducial_set(&self, index: usize) -> bool {
        self.fiducials.is_set(index)
    }

    pub fn are_tracker_fiducials_set(&self) -> bool {
        self.fiducials.all_set()
    }

    pub fn tracker_id(&self) -> Option<DeviceKind> {
        self.tracker_id
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn lib_mode(&self) -> LibMode {
        self.connection
            .as_ref()
            .map(|c| c.lib_mode())
            .unwrap_or_default()
    }

    pub fn save_state(&self) -> Result<()> {
        let state = TrackerState {
            tracker_id: self.tracker_id.map_or(0, DeviceKind::id),
            tracker_fiducials: self
                .fiducials
                .coords
                .map(|row| row.map(|v| if v.is_nan() { None } else { Some(v) })),
            tracker_fiducials_raw: self.fiducials.raw,
            marker_tracker_fiducials_raw: self.fiducials.matrices.map(|m| matrix_to_rows(&m)),
            configuration: self.connection.as_ref().and_then(|c| c.configuration()),
        };
        self.session
            .set_state(TRACKER_STATE_KEY, serde_json::to_value(state)?)
    }

    /// Restore fiducials and reconnect the saved tracker with its saved configuration.
    ///
    /// A reconnect failure is logged; the restored fiducials are kept either way.
    pub fn load_state(&mut self) -> Result<()> {
        let Some(value) = self.session.get_state(TRACKER_STATE_KEY) else {
            return Ok(());
        };
        let state: TrackerState = serde_json::from_value(value)?;

        self.fiducials = FiducialSet {
            coords: state
                .tracker_fiducials
                .map(|row| row.map(|v| v.unwrap_or(f64::NAN))),
            raw: state.tracker_fiducials_raw,
            matrices: state
                .marker_tracker_fiducials_raw
                .map(|rows| matrix_from_rows(&rows)),
        };

        if state.tracker_id == 0 {
            return Ok(());
        }
        let kind = DeviceKind::from_id(state.tracker_id)
            .ok_or_else(|| NavError::State(format!("unknown tracker id {}", state.tracker_id)))?;
        if let Err(e) = self.set_tracker(kind, state.configuration) {
            log::warn!("Could not restore {}: {}", kind, e);
        }
        Ok(())
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.stop();
        }
        if let Some(connection) = self.connection.as_mut() {
            connection.disconnect();
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::MemorySession;
    use crate::types::PoseFrame;
    use rstest::rstest;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Hands out queued frames, then repeats the last one.
    pub(crate) struct ScriptedFeed {
        frames: Mutex<VecDeque<PoseFrame>>,
        last: Mutex<PoseFrame>,
    }

    impl ScriptedFeed {
        pub fn new(frames: Vec<PoseFrame>) -> Self {
            Self {
                frames: Mutex::new(frames.into()),
                last: Mutex::new(PoseFrame::default()),
            }
        }
    }

    impl PoseFeed for ScriptedFeed {
        fn snapshot(&self) -> Snapshot {
            let mut last = self.last.lock().unwrap();
            if let Some(frame) = self.frames.lock().unwrap().pop_front() {
                *last = frame;
            }
            Snapshot {
                frame: last.clone(),
                link: LinkState::Live,
                sequence: 1,
                updated: Some(std::time::Instant::now()),
            }
        }
    }

    pub(crate) fn positions(bodies: &[[f64; 3]]) -> PoseFrame {
        PoseFrame::new(
            bodies
                .iter()
                .map(|p| RawPoseSample::new(*p, [0.0; 3]))
                .collect(),
        )
    }

    fn tracker() -> Tracker {
        Tracker::new(Arc::new(MemorySession::new()), Collaborators::default())
    }

    fn connected_tracker() -> Tracker {
        let mut tracker = tracker();
        tracker.set_tracker(DeviceKind::DebugRandom, None).unwrap();
        tracker
    }

    #[test]
    fn test_defaults() {
        let tracker = tracker();
        assert!(tracker.tracker_id().is_none());
        assert!(!tracker.is_tracker_initialized());
        assert!(!tracker.are_tracker_fiducials_set());
        assert_eq!(tracker.fiducials().matrices.len(), 6);
    }

    #[test]
    fn test_static_median_flips_probe_z() {
        let mut tracker = tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![
            positions(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]),
            positions(&[[2.0, 3.0, 4.0], [5.0, 6.0, 7.0]]),
        ])));

        let reading = tracker.get_tracker_coordinates(RefMode::Static, 2);
        assert_eq!(&reading.coord[..3], &[1.5, 2.5, -3.5]);
        assert_eq!(&reading.raw[0][..3], &[1.5, 2.5, -3.5]);
        assert_eq!(&reading.raw[1][..3], &[4.5, 5.5, 6.5]);
    }

    #[test]
    fn test_dynamic_reading_is_relative_to_reference() {
        let mut tracker = tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[
            [11.0, 22.0, 33.0],
            [10.0, 20.0, 30.0],
        ])])));
        let reading = tracker.get_tracker_coordinates(RefMode::Dynamic, 1);
        let expected = [1.0, 2.0, -3.0];
        for (a, b) in reading.coord[..3].iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_no_connection_reads_neutral_frame() {
        let tracker = tracker();
        let reading = tracker.get_tracker_coordinates(RefMode::Dynamic, 3);
        assert_eq!(reading.link, LinkState::Disconnected);
        assert!(reading.visibilities.iter().all(|v| !v));
        assert!(reading.coord.iter().all(|v| *v == 0.0));
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    fn test_set_then_get_fiducial(#[case] index: usize) {
        let mut tracker = connected_tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[
            [7.0, -8.0, 9.0],
            [1.0, 1.0, 1.0],
        ])])));

        tracker.set_tracker_fiducial(RefMode::Static, index).unwrap();
        let (coords, raw) = tracker.get_tracker_fiducials();
        assert_eq!(coords[index], [7.0, -8.0, -9.0]);
        assert_eq!(&raw[2 * index][..3], &[7.0, -8.0, -9.0]);
        assert_eq!(&raw[2 * index + 1][..3], &[1.0, 1.0, 1.0]);
        assert!(tracker.is_tracker_fiducial_set(index));
    }

    #[test]
    fn test_fiducial_rejects_bad_index_and_hidden_markers() {
        let mut tracker = tracker();
        assert!(matches!(
            tracker.set_tracker_fiducial(RefMode::Static, 3),
            Err(NavError::FiducialIndex(3))
        ));
        assert!(matches!(
            tracker.set_tracker_fiducial(RefMode::Static, 0),
            Err(NavError::State(_))
        ));

        let mut tracker = connected_tracker();
        let mut frame = positions(&[[1.0; 3], [2.0; 3]]);
        frame.bodies[1].visible = false;
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![frame])));
        assert!(matches!(
            tracker.set_tracker_fiducial(RefMode::Dynamic, 0),
            Err(NavError::MarkerNotVisible("head"))
        ));
        assert!(!tracker.is_tracker_fiducial_set(0));
    }

    #[test]
    fn test_reset_clears_every_fiducial() {
        let mut tracker = connected_tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[[1.0; 3], [2.0; 3]])])));
        for i in 0..3 {
            tracker.set_tracker_fiducial(RefMode::Dynamic, i).unwrap();
        }
        assert!(tracker.are_tracker_fiducials_set());

        tracker.reset_tracker_fiducials().unwrap();
        assert!(!tracker.are_tracker_fiducials_set());
        let (coords, _) = tracker.get_tracker_fiducials();
        assert!(coords.iter().flatten().all(|v| v.is_nan()));
        assert_eq!(tracker.tracker_fiducial_for_ui(0, 0), 0.0);
    }

    #[test]
    fn test_matrix_fiducials_are_probe_in_reference_frame() {
        let mut tracker = connected_tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[
            [5.0, 5.0, 5.0],
            [1.0, 2.0, 3.0],
        ])])));
        tracker.set_tracker_fiducial(RefMode::Dynamic, 0).unwrap();
        let m = tracker.get_matrix_tracker_fiducials()[0];
        assert!((m[(0, 3)] - 4.0).abs() < 1e-9);
        assert!((m[(1, 3)] - 3.0).abs() < 1e-9);
        assert!((m[(2, 3)] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_failed_connect_leaves_defaults() {
        let mut tracker = tracker();
        let err = tracker.set_tracker(DeviceKind::Claron, None).unwrap_err();
        assert!(matches!(
            err,
            NavError::Connection {
                kind: DeviceKind::Claron,
                lib_mode: LibMode::Error
            }
        ));
        assert!(tracker.tracker_id().is_none());
        assert!(!tracker.is_tracker_initialized());
        assert_eq!(tracker.lib_mode(), LibMode::Error);
    }

    #[test]
    fn test_state_round_trips_nan_through_null() {
        let session: Arc<dyn SessionStore> = Arc::new(MemorySession::new());
        let mut tracker = Tracker::new(session.clone(), Collaborators::default());
        tracker.set_tracker(DeviceKind::DebugRandom, None).unwrap();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[
            [4.0, 5.0, 6.0],
            [1.0, 1.0, 1.0],
        ])])));
        tracker.set_tracker_fiducial(RefMode::Static, 0).unwrap();

        let stored = session.get_state(TRACKER_STATE_KEY).unwrap();
        assert_eq!(stored["tracker_id"], 9);
        assert_eq!(stored["tracker_fiducials"][0][2], -6.0);
        assert!(stored["tracker_fiducials"][1][0].is_null());
        assert_eq!(stored["marker_tracker_fiducials_raw"].as_array().unwrap().len(), 6);

        let mut restored = Tracker::new(session, Collaborators::default());
        restored.load_state().unwrap();
        assert_eq!(restored.tracker_id(), Some(DeviceKind::DebugRandom));
        assert!(restored.is_tracker_fiducial_set(0));
        assert!(!restored.is_tracker_fiducial_set(1));
        assert_eq!(restored.fiducials().raw, tracker.fiducials().raw);
        assert_eq!(restored.fiducials().matrices, tracker.fiducials().matrices);
    }

    #[test]
    fn test_disconnect_resets_fiducials_and_buffer() {
        let mut tracker = connected_tracker();
        tracker.set_pose_feed(Arc::new(ScriptedFeed::new(vec![positions(&[[1.0; 3], [2.0; 3]])])));
        tracker.set_tracker_fiducial(RefMode::Dynamic, 1).unwrap();
        tracker.disconnect_tracker();
        assert!(!tracker.is_tracker_initialized());
        assert!(!tracker.is_tracker_fiducial_set(1));
        assert_eq!(tracker.coordinates().snapshot().link, LinkState::Disconnected);
    }
}

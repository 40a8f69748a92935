//! End-to-end navigation flow over the debug tracker with a scripted pose feed.

use neuronav::coregistration::{calculate_fre, corregistrate_probe, fiducial_transform};
use neuronav::markers::NoObserver;
use neuronav::{
    Collaborators, DeviceKind, JsonFileSession, LinkState, Marker, MarkersControl, PoseFeed,
    PoseFrame, RawPoseSample, RefMode, SessionStore, Snapshot, Tracker,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;

const REFERENCE_AT: [f64; 3] = [10.0, 20.0, 30.0];
const IMAGE_OFFSET: [f64; 3] = [5.0, -3.0, 2.0];

/// Probe offsets from the reference body, one per landmark.
const LANDMARKS: [[f64; 3]; 3] = [[40.0, 0.0, 5.0], [-40.0, 0.0, 5.0], [0.0, 60.0, -10.0]];

/// Feed whose frame the test moves by hand.
struct HandFeed {
    frame: Mutex<PoseFrame>,
}

impl HandFeed {
    fn new() -> Self {
        Self {
            frame: Mutex::new(PoseFrame::default()),
        }
    }

    fn place_probe(&self, offset: [f64; 3]) {
        let probe = [
            REFERENCE_AT[0] + offset[0],
            REFERENCE_AT[1] + offset[1],
            REFERENCE_AT[2] + offset[2],
        ];
        *self.frame.lock().unwrap() = PoseFrame::new(vec![
            RawPoseSample::new(probe, [0.0; 3]),
            RawPoseSample::new(REFERENCE_AT, [0.0; 3]),
        ]);
    }
}

impl PoseFeed for HandFeed {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            frame: self.frame.lock().unwrap().clone(),
            link: LinkState::Live,
            sequence: 1,
            updated: Some(Instant::now()),
        }
    }
}

fn image_fiducials() -> [[f64; 3]; 3] {
    LANDMARKS.map(|d| {
        [
            d[0] + IMAGE_OFFSET[0],
            d[1] + IMAGE_OFFSET[1],
            -d[2] + IMAGE_OFFSET[2],
        ]
    })
}

fn session_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("neuronav-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

fn register(tracker: &mut Tracker, feed: &HandFeed) {
    for (i, offset) in LANDMARKS.iter().enumerate() {
        feed.place_probe(*offset);
        tracker.set_tracker_fiducial(RefMode::Dynamic, i).unwrap();
    }
}

#[test]
fn test_fiducial_registration_maps_probe_into_image() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = session_dir("navigation");
    let session: Arc<dyn SessionStore> = Arc::new(JsonFileSession::open(&dir).unwrap());

    let mut tracker = Tracker::new(session.clone(), Collaborators::default());
    tracker.set_tracker(DeviceKind::DebugRandom, None).unwrap();
    let feed = Arc::new(HandFeed::new());
    tracker.set_pose_feed(feed.clone());

    register(&mut tracker, &feed);
    assert!(tracker.are_tracker_fiducials_set());

    let (coords, raw) = tracker.get_tracker_fiducials();
    let image = image_fiducials();
    let m_change = fiducial_transform(&image, coords).unwrap();
    let fre = calculate_fre(raw, &image, RefMode::Dynamic, &m_change, None);
    assert!(fre < 1e-6, "fre {}", fre);

    feed.place_probe([1.0, 2.0, 3.0]);
    let reading = tracker.get_tracker_coordinates(RefMode::Dynamic, 1);
    let (pose, _) = corregistrate_probe(&m_change, None, &reading.raw, RefMode::Dynamic, None);
    let expected = [6.0, -1.0, -1.0];
    for (a, b) in pose[..3].iter().zip(expected.iter()) {
        assert!((a - b).abs() < 1e-6, "{:?}", pose);
    }

    let mut markers = MarkersControl::new(session.clone(), Arc::new(NoObserver));
    let id = markers
        .add_marker(
            Marker::new([pose[0], pose[1], pose[2]], Some([0.0; 3]), "stimulation site"),
            true,
            false,
        )
        .unwrap();
    markers.set_target(id).unwrap();
    assert_eq!(markers.find_target(None).map(|m| m.label.as_str()), Some("stimulation site"));

    tracker.disconnect_tracker();
    assert!(!tracker.are_tracker_fiducials_set());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_session_survives_reopen() {
    let dir = session_dir("reopen");
    {
        let session: Arc<dyn SessionStore> = Arc::new(JsonFileSession::open(&dir).unwrap());
        let mut tracker = Tracker::new(session.clone(), Collaborators::default());
        tracker.set_tracker(DeviceKind::DebugApproach, None).unwrap();
        let feed = Arc::new(HandFeed::new());
        tracker.set_pose_feed(feed.clone());
        feed.place_probe(LANDMARKS[1]);
        tracker.set_tracker_fiducial(RefMode::Dynamic, 1).unwrap();

        let mut markers = MarkersControl::new(session, Arc::new(NoObserver));
        markers
            .add_marker(Marker::new([1.0, 2.0, 3.0], None, "nasion"), true, false)
            .unwrap();
    }

    let session: Arc<dyn SessionStore> = Arc::new(JsonFileSession::open(&dir).unwrap());
    let mut tracker = Tracker::new(session.clone(), Collaborators::default());
    tracker.load_state().unwrap();
    assert_eq!(tracker.tracker_id(), Some(DeviceKind::DebugApproach));
    assert!(!tracker.is_tracker_fiducial_set(0));
    assert!(tracker.is_tracker_fiducial_set(1));
    let (coords, _) = tracker.get_tracker_fiducials();
    for (a, b) in coords[1].iter().zip([-40.0, 0.0, -5.0].iter()) {
        assert!((a - b).abs() < 1e-9, "{:?}", coords[1]);
    }

    let mut markers = MarkersControl::new(session, Arc::new(NoObserver));
    markers.load_state().unwrap();
    assert_eq!(markers.len(), 1);
    assert_eq!(markers.markers()[0].label, "nasion");
    assert!(markers.markers()[0].orientation.is_none());

    tracker.disconnect_tracker();
    let _ = std::fs::remove_dir_all(&dir);
}

//! # neuronav - tracker sampling, coregistration and robot bridge for neuronavigation
//!
//! Maps poses from an external tracking device into patient image space. Provides:
//! - One connection contract over Polhemus, NDI Polaris, wrapper-library and debug trackers
//! - A background sampler that keeps a latest-pose buffer current without blocking readers
//! - Fiducial and ICP coregistration
//! - A robot-control worker speaking the Elfin TCP protocol
//! - Marker and target bookkeeping with session persistence
//!
//! ## Quick Start
//! ```no_run
//! use neuronav::{Collaborators, DeviceKind, MemorySession, RefMode, Tracker};
//! use std::sync::Arc;
//!
//! let mut tracker = Tracker::new(Arc::new(MemorySession::new()), Collaborators::default());
//! tracker.set_tracker(DeviceKind::DebugRandom, None).unwrap();
//!
//! for _ in 0..10 {
//!     let reading = tracker.get_tracker_coordinates(RefMode::Dynamic, 3);
//!     println!("probe: {:?} visible: {:?}", &reading.coord[..3], reading.visibilities);
//!     std::thread::sleep(std::time::Duration::from_millis(100));
//! }
//! ```

pub mod error;
pub mod types;
pub mod transform;
pub mod protocol;
pub mod transport;
pub mod wrapper;
pub mod session;
pub mod worker;
pub mod connection;
pub mod coordinates;
pub mod sampler;
pub mod tracker;
pub mod coregistration;
pub mod icp;
pub mod elfin;
pub mod robot;
pub mod markers;

pub use error::NavError;
pub use types::*;
pub use connection::{
    create_connection, Collaborators, ConfigDialogs, Connection, TrackerConnection,
};
pub use coordinates::{LinkState, PoseFeed, Snapshot, TrackerCoordinates};
pub use sampler::{CoordinateSampler, SamplingConfig};
pub use session::{JsonFileSession, MemorySession, SessionStore};
pub use tracker::{Tracker, TrackerReading};
pub use icp::IterativeClosestPoint;
pub use robot::{Robot, RobotBridge, RobotObjective};
pub use markers::{Marker, MarkerObserver, MarkersControl};

/// Result type alias for neuronav operations.
pub type Result<T> = std::result::Result<T, NavError>;

use crate::types::PoseFrame;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Whether the latest frame came from a working device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// No sampler has published yet, or the tracker was disconnected.
    #[default]
    Disconnected,
    Live,
    /// Reads are failing; the frame is the last good one with every body hidden.
    Lost,
}

/// Copy of the shared buffer at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub frame: PoseFrame,
    pub link: LinkState,
    /// Number of frames published since the buffer was created.
    pub sequence: u64,
    pub updated: Option<Instant>,
}

impl Snapshot {
    pub fn visibilities(&self) -> Vec<bool> {
        self.frame.visibilities()
    }

    /// Time since the last publication, `None` before the first one.
    pub fn age(&self) -> Option<Duration> {
        self.updated.map(|t| t.elapsed())
    }

    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.age().map_or(true, |age| age > max_age)
    }
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            frame: PoseFrame::default(),
            link: LinkState::Disconnected,
            sequence: 0,
            updated: None,
        }
    }
}

/// Anything that can hand out the latest tracker frame without blocking on hardware.
pub trait PoseFeed: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Latest-value buffer written by the sampler and copied out by readers.
#[derive(Debug, Default)]
pub struct TrackerCoordinates {
    slot: Mutex<Snapshot>,
}

impl TrackerCoordinates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the frame. Only the sampler calls this.
    pub fn publish(&self, frame: PoseFrame) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.frame = frame;
            slot.link = LinkState::Live;
            slot.sequence += 1;
            slot.updated = Some(Instant::now());
        }
    }

    /// Keep the last positions but hide every body.
    pub fn mark_lost(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            for body in slot.frame.bodies.iter_mut() {
                body.visible = false;
            }
            slot.link = LinkState::Lost;
        }
    }

    /// Reset to a neutral frame after a disconnect.
    pub fn clear(&self) {
        if let Ok(mut slot) = self.slot.lock() {
            let sequence = slot.sequence;
            *slot = Snapshot {
                sequence,
                ..Snapshot::default()
            };
        }
    }

    pub fn get_coordinates(&self) -> (PoseFrame, Vec<bool>) {
        let snapshot = self.snapshot();
        let visibilities = snapshot.visibilities();
        (snapshot.frame, visibilities)
    }
}

impl PoseFeed for TrackerCoordinates {
    fn snapshot(&self) -> Snapshot {
        self.slot
            .lock()
            .map(|slot| slot.clone())
            .unwrap_or_default()
    }
}

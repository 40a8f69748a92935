use serde::{Deserialize, Serialize};
use std::fmt;

/// Tracking device family. Selects an entry of the connection factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum DeviceKind {
    Claron,
    Fastrak,
    IsotrakII,
    Patriot,
    Camera,
    Polaris,
    PolarisP4,
    Optitrack,
    DebugRandom,
    DebugApproach,
    Robot,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 11] = [
        DeviceKind::Claron,
        DeviceKind::Fastrak,
        DeviceKind::IsotrakII,
        DeviceKind::Patriot,
        DeviceKind::Camera,
        DeviceKind::Polaris,
        DeviceKind::PolarisP4,
        DeviceKind::Optitrack,
        DeviceKind::DebugRandom,
        DeviceKind::DebugApproach,
        DeviceKind::Robot,
    ];

    /// Persisted session id. 0 is reserved for "no tracker selected".
    pub fn id(self) -> u8 {
        match self {
            DeviceKind::Claron => 1,
            DeviceKind::Fastrak => 2,
            DeviceKind::IsotrakII => 3,
            DeviceKind::Patriot => 4,
            DeviceKind::Camera => 5,
            DeviceKind::Polaris => 6,
            DeviceKind::PolarisP4 => 7,
            DeviceKind::Optitrack => 8,
            DeviceKind::DebugRandom => 9,
            DeviceKind::DebugApproach => 10,
            DeviceKind::Robot => 11,
        }
    }

    pub fn from_id(id: u8) -> Option<DeviceKind> {
        DeviceKind::ALL.into_iter().find(|k| k.id() == id)
    }

    /// Transports attempted by `connect`, in fallback order.
    pub fn transports(self) -> Transports {
        match self {
            DeviceKind::Fastrak | DeviceKind::IsotrakII | DeviceKind::Patriot => Transports::all(),
            DeviceKind::Polaris | DeviceKind::PolarisP4 => Transports::SERIAL,
            DeviceKind::DebugRandom | DeviceKind::DebugApproach | DeviceKind::Robot => {
                Transports::empty()
            }
            DeviceKind::Claron | DeviceKind::Camera | DeviceKind::Optitrack => Transports::WRAPPER,
        }
    }

    pub fn is_polhemus(self) -> bool {
        matches!(
            self,
            DeviceKind::Fastrak | DeviceKind::IsotrakII | DeviceKind::Patriot
        )
    }

    pub fn is_debug(self) -> bool {
        matches!(self, DeviceKind::DebugRandom | DeviceKind::DebugApproach)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Claron => "Claron MicronTracker",
            DeviceKind::Fastrak => "Polhemus FASTRAK",
            DeviceKind::IsotrakII => "Polhemus ISOTRAK II",
            DeviceKind::Patriot => "Polhemus PATRIOT",
            DeviceKind::Camera => "Camera tracker",
            DeviceKind::Polaris => "NDI Polaris",
            DeviceKind::PolarisP4 => "NDI Polaris P4",
            DeviceKind::Optitrack => "Optitrack",
            DeviceKind::DebugRandom => "Debug tracker (random)",
            DeviceKind::DebugApproach => "Debug tracker (approach)",
            DeviceKind::Robot => "Robot tracker",
        };
        f.write_str(name)
    }
}

impl From<DeviceKind> for u8 {
    fn from(kind: DeviceKind) -> u8 {
        kind.id()
    }
}

impl TryFrom<u8> for DeviceKind {
    type Error = String;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        DeviceKind::from_id(id).ok_or_else(|| format!("unknown tracker id {}", id))
    }
}

bitflags::bitflags! {
    /// Transport families a device kind can be reached through.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Transports: u8 {
        const WRAPPER = 1 << 0;
        const USB     = 1 << 1;
        const SERIAL  = 1 << 2;
    }
}

/// Transport that is currently live for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibMode {
    #[default]
    Unset,
    Wrapper,
    Usb,
    Serial,
    Debug,
    Error,
}

impl fmt::Display for LibMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LibMode::Unset => "unset",
            LibMode::Wrapper => "wrapper",
            LibMode::Usb => "usb",
            LibMode::Serial => "serial",
            LibMode::Debug => "debug",
            LibMode::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Unconfigured,
    Configured,
    Connected,
    Disconnected,
    Error,
}

/// Static uses a single tracked body; dynamic expresses the probe relative to a head reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RefMode {
    Static,
    #[default]
    Dynamic,
}

/// 6DOF pose of one tracked body. Orientation is in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RawPoseSample {
    pub position: [f64; 3],
    pub orientation: [f64; 3],
    pub visible: bool,
}

impl RawPoseSample {
    pub fn new(position: [f64; 3], orientation: [f64; 3]) -> Self {
        Self {
            position,
            orientation,
            visible: true,
        }
    }

    /// Zero pose flagged as not visible.
    pub fn hidden() -> Self {
        Self::default()
    }

    pub fn from_array(values: [f64; 6], visible: bool) -> Self {
        Self {
            position: [values[0], values[1], values[2]],
            orientation: [values[3], values[4], values[5]],
            visible,
        }
    }

    pub fn to_array(&self) -> [f64; 6] {
        let [x, y, z] = self.position;
        let [a, b, g] = self.orientation;
        [x, y, z, a, b, g]
    }
}

/// Index of the probe body inside a frame.
pub const PROBE: usize = 0;
/// Index of the head reference body inside a frame.
pub const REFERENCE: usize = 1;
/// Frames always carry at least probe, reference and one coil.
pub const MIN_BODIES: usize = 3;

/// One multi-body read from a tracker.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseFrame {
    pub bodies: Vec<RawPoseSample>,
}

impl PoseFrame {
    pub fn new(mut bodies: Vec<RawPoseSample>) -> Self {
        if bodies.len() < MIN_BODIES {
            bodies.resize(MIN_BODIES, RawPoseSample::hidden());
        }
        Self { bodies }
    }

    /// Zero-filled frame with every body hidden.
    pub fn neutral(n_bodies: usize) -> Self {
        Self::new(vec![RawPoseSample::hidden(); n_bodies])
    }

    pub fn visibilities(&self) -> Vec<bool> {
        self.bodies.iter().map(|b| b.visible).collect()
    }

    pub fn body(&self, index: usize) -> RawPoseSample {
        self.bodies
            .get(index)
            .copied()
            .unwrap_or_else(RawPoseSample::hidden)
    }
}

impl Default for PoseFrame {
    fn default() -> Self {
        Self::neutral(MIN_BODIES)
    }
}

/// Device parameters captured by a configuration dialog, replayable without prompting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Configuration {
    Serial {
        com_port: String,
        baud_rate: u32,
    },
    Polaris {
        com_port: String,
        probe_dir: String,
        ref_dir: String,
        obj_dirs: Vec<String>,
    },
    PolarisP4 {
        com_port: String,
        probe_dir: String,
        ref_dir: String,
        obj_dir: String,
    },
    Optitrack {
        calibration: String,
        user_profile: String,
    },
    Robot {
        tracker: DeviceKind,
        tracker_configuration: Option<Box<Configuration>>,
        robot_ip: String,
    },
}

impl Configuration {
    pub fn com_port(&self) -> Option<&str> {
        match self {
            Configuration::Serial { com_port, .. }
            | Configuration::Polaris { com_port, .. }
            | Configuration::PolarisP4 { com_port, .. } => Some(com_port),
            _ => None,
        }
    }
}

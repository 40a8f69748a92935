use crate::types::{DeviceKind, LibMode};

/// Errors raised by tracker connections, the sampler, coregistration and the robot bridge.
#[derive(Debug, thiserror::Error)]
pub enum NavError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session serialization error: {0}")]
    Session(#[from] serde_json::Error),

    #[error("Device not found (VID={vid:04X} PID={pid:04X})")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Configuration rejected: {0}")]
    Configuration(String),

    #[error("Could not connect to {kind} (lib mode: {lib_mode})")]
    Connection { kind: DeviceKind, lib_mode: LibMode },

    #[error("Malformed tracker frame: {0}")]
    TransientRead(String),

    #[error("Command {command} failed with code {code}")]
    Protocol { command: String, code: String },

    #[error("Invalid state: {0}")]
    State(String),

    #[error("Fiducial index out of range (0-2): {0}")]
    FiducialIndex(usize),

    #[error("{0} marker not visible")]
    MarkerNotVisible(&'static str),

    #[error("Wrapper library for {0} is not installed")]
    LibraryMissing(DeviceKind),

    #[error("Timeout waiting for data")]
    Timeout,

    #[error("Worker stopped")]
    StreamStopped,

    #[error("Channel disconnected")]
    ChannelDisconnected,
}

impl NavError {
    /// True for errors that only affect a single frame and should not stop a read loop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NavError::TransientRead(_) | NavError::Timeout | NavError::Usb(rusb::Error::Timeout)
        )
    }
}

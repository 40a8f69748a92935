//! Tracker connection family.
//!
//! Every device kind implements the same lifecycle. [`create_connection`] is the
//! factory table keyed on [`DeviceKind`]; the returned [`Connection`] is a closed enum
//! over the per-family backends.

mod debug;
mod ndi;
mod polhemus;
mod robot;
mod vendor;

pub use debug::{DebugApproachReader, DebugConnection, DebugRandomReader};
pub use ndi::NdiConnection;
pub use polhemus::PolhemusConnection;
pub use robot::{RobotConnection, RobotConnector};
pub use vendor::VendorConnection;

use crate::transport::{SystemTransports, TransportOpener};
use crate::types::{Configuration, ConnectionState, DeviceKind, LibMode, PoseFrame};
use crate::wrapper::WrapperRegistry;
use crate::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Capability contract shared by every tracker backend.
pub trait TrackerConnection {
    fn kind(&self) -> DeviceKind;

    /// Gather device parameters. Returns false when the user cancels.
    fn configure(&mut self) -> bool;

    /// Try to open the device. Failures are recorded in `lib_mode` and `state`.
    fn connect(&mut self);

    /// Release the device. Always ends in `Disconnected`; a failed close sets `lib_mode` to error.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;
    fn connection(&self) -> Option<DeviceHandle>;
    fn configuration(&self) -> Option<Configuration>;
    fn set_configuration(&mut self, configuration: Option<Configuration>);
    fn lib_mode(&self) -> LibMode;
    fn state(&self) -> ConnectionState;
}

/// A live device that produces pose frames.
pub trait PoseReader: Send {
    fn read_frame(&mut self) -> Result<PoseFrame>;
    fn close(&mut self) -> Result<()>;
}

/// Shared handle to the reader of a connected device.
///
/// The sampler reads through it while the owning connection keeps it for teardown.
/// A non-transient read error marks the handle faulted until the next good frame.
#[derive(Clone)]
pub struct DeviceHandle {
    reader: Arc<Mutex<Box<dyn PoseReader>>>,
    faulted: Arc<AtomicBool>,
}

impl DeviceHandle {
    pub fn new(reader: Box<dyn PoseReader>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            faulted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn read_frame(&self) -> Result<PoseFrame> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| crate::NavError::State("device reader lock poisoned".into()))?;
        match reader.read_frame() {
            Ok(frame) => {
                self.faulted.store(false, Ordering::Relaxed);
                Ok(frame)
            }
            Err(e) => {
                if !e.is_transient() {
                    self.faulted.store(true, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Relaxed)
    }

    fn close(&self) -> Result<()> {
        let mut reader = self
            .reader
            .lock()
            .map_err(|_| crate::NavError::State("device reader lock poisoned".into()))?;
        reader.close()
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("faulted", &self.is_faulted())
            .finish()
    }
}

/// Supplies device parameters. Each method returns `None` when the user cancels.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigDialogs: Send + Sync {
    /// COM port for serial-capable trackers.
    fn serial_port(&self, kind: DeviceKind) -> Option<Configuration>;
    /// COM port and tool definition files for the Polaris family.
    fn polaris(&self, kind: DeviceKind) -> Option<Configuration>;
    /// Calibration and user profile files.
    fn optitrack(&self) -> Option<Configuration>;
    /// Tracker kind driving the robot and the robot controller address.
    fn robot(&self) -> Option<(DeviceKind, String)>;
}

/// Dialog stand-in that cancels everything. Used when no UI is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDialogs;

impl ConfigDialogs for NoDialogs {
    fn serial_port(&self, _kind: DeviceKind) -> Option<Configuration> {
        None
    }

    fn polaris(&self, _kind: DeviceKind) -> Option<Configuration> {
        None
    }

    fn optitrack(&self) -> Option<Configuration> {
        None
    }

    fn robot(&self) -> Option<(DeviceKind, String)> {
        None
    }
}

/// External services a connection may call on.
#[derive(Clone)]
pub struct Collaborators {
    pub dialogs: Arc<dyn ConfigDialogs>,
    pub wrappers: WrapperRegistry,
    pub transports: Arc<dyn TransportOpener>,
    pub robot: Arc<dyn RobotConnector>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            dialogs: Arc::new(NoDialogs),
            wrappers: WrapperRegistry::new(),
            transports: Arc::new(SystemTransports),
            robot: Arc::new(robot::NoRobot),
        }
    }
}

/// State shared by every backend.
#[derive(Debug)]
pub(crate) struct ConnectionCore {
    pub kind: DeviceKind,
    pub state: ConnectionState,
    pub lib_mode: LibMode,
    pub configuration: Option<Configuration>,
    pub handle: Option<DeviceHandle>,
}

impl ConnectionCore {
    pub fn new(kind: DeviceKind) -> Self {
        Self {
            kind,
            state: ConnectionState::Unconfigured,
            lib_mode: LibMode::Unset,
            configuration: None,
            handle: None,
        }
    }

    pub fn mark_configured(&mut self) {
        if self.state == ConnectionState::Unconfigured {
            self.state = ConnectionState::Configured;
        }
    }

    pub fn attach(&mut self, reader: Box<dyn PoseReader>, lib_mode: LibMode) {
        self.handle = Some(DeviceHandle::new(reader));
        self.lib_mode = lib_mode;
        self.state = ConnectionState::Connected;
        log::info!("{} connected (lib mode: {})", self.kind, lib_mode);
    }

    pub fn fail(&mut self) {
        self.handle = None;
        self.lib_mode = LibMode::Error;
        self.state = ConnectionState::Error;
        log::warn!("Could not connect to {}", self.kind);
    }

    /// Close the reader (if any) and move to `Disconnected`.
    pub fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.close() {
                Ok(()) => log::info!("{} disconnected ({})", self.kind, self.lib_mode),
                Err(e) => {
                    log::warn!("{} did not close cleanly: {}", self.kind, e);
                    self.lib_mode = LibMode::Error;
                }
            }
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.handle, self.state) {
            (Some(handle), ConnectionState::Connected) if handle.is_faulted() => {
                ConnectionState::Error
            }
            (_, state) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_some() && self.lib_mode != LibMode::Error
    }

    pub fn set_configuration(&mut self, configuration: Option<Configuration>) {
        let has_value = configuration.is_some();
        self.configuration = configuration;
        if has_value {
            self.mark_configured();
        }
    }
}

/// Closed set of tracker backends.
pub enum Connection {
    Polhemus(PolhemusConnection),
    Ndi(NdiConnection),
    Vendor(VendorConnection),
    Debug(DebugConnection),
    Robot(RobotConnection),
}

/// Factory table: builds the backend for `kind`. `n_coils` sizes the frames of trackers
/// that report a variable number of bodies.
pub fn create_connection(kind: DeviceKind, n_coils: usize, collab: &Collaborators) -> Connection {
    match kind {
        DeviceKind::Fastrak | DeviceKind::IsotrakII | DeviceKind::Patriot => {
            Connection::Polhemus(PolhemusConnection::new(kind, collab.clone()))
        }
        DeviceKind::Polaris | DeviceKind::PolarisP4 => {
            Connection::Ndi(NdiConnection::new(kind, collab.clone()))
        }
        DeviceKind::Claron | DeviceKind::Camera | DeviceKind::Optitrack => {
            Connection::Vendor(VendorConnection::new(kind, collab.clone()))
        }
        DeviceKind::DebugRandom | DeviceKind::DebugApproach => {
            Connection::Debug(DebugConnection::new(kind, n_coils))
        }
        DeviceKind::Robot => Connection::Robot(RobotConnection::new(n_coils, collab.clone())),
    }
}

macro_rules! dispatch {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            Connection::Polhemus($conn) => $body,
            Connection::Ndi($conn) => $body,
            Connection::Vendor($conn) => $body,
            Connection::Debug($conn) => $body,
            Connection::Robot($conn) => $body,
        }
    };
}

impl TrackerConnection for Connection {
    fn kind(&self) -> DeviceKind {
        dispatch!(self, c => c.kind())
    }

    fn configure(&mut self) -> bool {
        dispatch!(self, c => c.configure())
    }

    fn connect(&mut self) {
        dispatch!(self, c => c.connect())
    }

    fn disconnect(&mut self) {
        dispatch!(self, c => c.disconnect())
    }

    fn is_connected(&self) -> bool {
        dispatch!(self, c => c.is_connected())
    }

    fn connection(&self) -> Option<DeviceHandle> {
        dispatch!(self, c => c.connection())
    }

    fn configuration(&self) -> Option<Configuration> {
        dispatch!(self, c => c.configuration())
    }

    fn set_configuration(&mut self, configuration: Option<Configuration>) {
        dispatch!(self, c => c.set_configuration(configuration))
    }

    fn lib_mode(&self) -> LibMode {
        dispatch!(self, c => c.lib_mode())
    }

    fn state(&self) -> ConnectionState {
        dispatch!(self, c => c.state())
    }
}

/// `TrackerConnection` methods that only read or write the shared core.
macro_rules! core_accessors {
    () => {
        fn kind(&self) -> crate::types::DeviceKind {
            self.core.kind
        }

        fn disconnect(&mut self) {
            self.core.release();
        }

        fn is_connected(&self) -> bool {
            self.core.is_connected()
        }

        fn connection(&self) -> Option<crate::connection::DeviceHandle> {
            self.core.handle.clone()
        }

        fn configuration(&self) -> Option<crate::types::Configuration> {
            self.core.configuration.clone()
        }

        fn set_configuration(&mut self, configuration: Option<crate::types::Configuration>) {
            self.core.set_configuration(configuration);
        }

        fn lib_mode(&self) -> crate::types::LibMode {
            self.core.lib_mode
        }

        fn state(&self) -> crate::types::ConnectionState {
            self.core.state()
        }
    };
}
pub(crate) use core_accessors;

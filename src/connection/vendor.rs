use super::{core_accessors, Collaborators, ConnectionCore, PoseReader, TrackerConnection};
use crate::types::{DeviceKind, LibMode, PoseFrame};
use crate::wrapper::WrapperLibrary;
use crate::{NavError, Result};

/// Frames read through a vendor SDK binding.
pub(crate) struct WrapperReader {
    lib: Box<dyn WrapperLibrary>,
}

impl WrapperReader {
    pub fn new(lib: Box<dyn WrapperLibrary>) -> Self {
        Self { lib }
    }
}

impl PoseReader for WrapperReader {
    fn read_frame(&mut self) -> Result<PoseFrame> {
        self.lib.run()
    }

    fn close(&mut self) -> Result<()> {
        self.lib.close()
    }
}

/// Claron MicronTracker, camera tracker and Optitrack: trackers only reachable
/// through a vendor SDK registered in [`crate::wrapper::WrapperRegistry`].
pub struct VendorConnection {
    core: ConnectionCore,
    collab: Collaborators,
}

impl VendorConnection {
    pub fn new(kind: DeviceKind, collab: Collaborators) -> Self {
        Self {
            core: ConnectionCore::new(kind),
            collab,
        }
    }

    fn open(&self) -> Result<Box<dyn PoseReader>> {
        let kind = self.core.kind;
        let mut lib = self
            .collab
            .wrappers
            .create(kind)
            .ok_or(NavError::LibraryMissing(kind))?;
        lib.initialize(self.core.configuration.clone())?;
        Ok(Box::new(WrapperReader::new(lib)))
    }
}

impl TrackerConnection for VendorConnection {
    core_accessors!();

    fn configure(&mut self) -> bool {
        if self.core.kind != DeviceKind::Optitrack {
            self.core.mark_configured();
            return true;
        }
        if self.core.configuration.is_some() {
            return true;
        }
        match self.collab.dialogs.optitrack() {
            Some(configuration) => {
                self.core.set_configuration(Some(configuration));
                true
            }
            None => {
                log::info!("Optitrack configuration cancelled");
                false
            }
        }
    }

    fn connect(&mut self) {
        self.core.release();
        match self.open() {
            Ok(reader) => self.core.attach(reader, LibMode::Wrapper),
            Err(e) => {
                log::warn!("{}: {}", self.core.kind, e);
                self.core.fail();
            }
        }
    }
}

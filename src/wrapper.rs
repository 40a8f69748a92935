//! Bindings to closed vendor SDKs (MicronTracker, Motive, the Polhemus PDI library,
//! camera trackers). The host application registers a factory per device kind.

use crate::types::{Configuration, DeviceKind, PoseFrame};
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// One live session with a vendor SDK. Frames are already in millimetres and degrees.
#[cfg_attr(test, mockall::automock)]
pub trait WrapperLibrary: Send {
    fn initialize(&mut self, configuration: Option<Configuration>) -> Result<()>;
    fn run(&mut self) -> Result<PoseFrame>;
    fn close(&mut self) -> Result<()>;
}

pub type WrapperFactory = Arc<dyn Fn() -> Box<dyn WrapperLibrary> + Send + Sync>;

#[derive(Clone, Default)]
pub struct WrapperRegistry {
    factories: HashMap<DeviceKind, WrapperFactory>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: DeviceKind, factory: F)
    where
        F: Fn() -> Box<dyn WrapperLibrary> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn is_installed(&self, kind: DeviceKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// A fresh library instance, or `None` when no binding is installed for `kind`.
    pub fn create(&self, kind: DeviceKind) -> Option<Box<dyn WrapperLibrary>> {
        self.factories.get(&kind).map(|factory| factory())
    }
}

impl std::fmt::Debug for WrapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapperRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

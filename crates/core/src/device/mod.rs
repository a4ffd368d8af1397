//! Device capability contract and the startup registry of adapters.
//!
//! Nothing above this module knows which headset or camera produced a frame.
//! Adapters are looked up by identifier exactly once, when the engine process
//! starts; an unknown identifier is a [`ConfigError`], never a mid-session
//! surprise.

pub mod replay;
pub mod synthetic;
pub mod worker;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    config::DeviceConfig,
    error::{ConfigError, DeviceError},
};

pub use replay::ReplayDevice;
pub use synthetic::SyntheticDevice;
pub use worker::{DeviceControl, DeviceMessage, DeviceWorker};

/// One monocular gaze sample. Classified as personally identifying.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureFrame {
    /// Seconds on the device clock.
    pub timestamp: f64,
    pub gaze_x: f32,
    pub gaze_y: f32,
    pub valid: bool,
}

/// An opened device. Reads may block; the engine only ever calls this from
/// the device worker thread.
pub trait CaptureHandle: Send {
    fn poll_frame(&mut self) -> Result<CaptureFrame, DeviceError>;
    fn close(&mut self);
}

pub trait DeviceAdapter: Send {
    fn name(&self) -> &str;
    fn open(&mut self) -> Result<Box<dyn CaptureHandle>, DeviceError>;
}

pub type DeviceConstructor = fn(&DeviceConfig) -> Result<Box<dyn DeviceAdapter>, ConfigError>;

/// Maps device identifiers to adapter constructors.
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: BTreeMap<&'static str, DeviceConstructor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Registry holding every adapter shipped with the crate.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("synthetic", SyntheticDevice::from_config);
        registry.register("replay", ReplayDevice::from_config);
        registry
    }

    pub fn register(&mut self, id: &'static str, constructor: DeviceConstructor) {
        self.constructors.insert(id, constructor);
    }

    pub fn ids(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.constructors.keys().copied()
    }

    pub fn select(&self, config: &DeviceConfig) -> Result<Box<dyn DeviceAdapter>, ConfigError> {
        let constructor = self
            .constructors
            .get(config.id.as_str())
            .ok_or_else(|| ConfigError::UnknownDevice {
                id: config.id.clone(),
                known: self.ids().collect::<Vec<_>>().join(", "),
            })?;

        let adapter = constructor(config)?;
        tracing::info!(device = adapter.name(), "device selected");
        Ok(adapter)
    }
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("ids", &self.ids().collect::<Vec<_>>())
            .finish()
    }
}

//! Core library for the gazeguard capture engine.
//!
//! The engine is the privileged side of a two-process design: it owns the
//! eye-tracking device, drives stimulus and recording through a small state
//! machine, keeps raw captures in a short-lived local store and lets trusted
//! infrastructure pull derived metrics only. The unprivileged control surface
//! talks to it through the command channel.

pub mod analysis;
pub mod bus;
pub mod calibration;
pub mod channel;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod export;
pub mod protocol;
pub mod record;
pub mod session;
pub mod stimulus;
pub mod store;

pub use analysis::{DerivedMetric, GazeAnalyzer, SpectralAnalyzer};
pub use bus::{Event, EventBus};
pub use calibration::{CalibrationBounds, CalibrationRun};
pub use channel::{CommandChannel, ControlClient, Envelope, Reply};
pub use config::EngineConfig;
pub use device::{CaptureFrame, DeviceAdapter, DeviceRegistry, DeviceWorker};
pub use engine::{
    runtime::{EngineIo, Timers},
    Engine, EngineParts, EngineState,
};
pub use error::{ErrorKind, GazeError, Result};
pub use export::{ExportBatch, ExportBridge, ExportRequest, ExportResponse, PeerCertificate};
pub use protocol::{Acknowledgement, Command, Notice};
pub use record::{Recorder, SealedBuffer};
pub use session::{SessionId, SessionRegistry};
pub use stimulus::{HeadlessStimulus, Paradigm, StimulusDriver};
pub use store::EphemeralStore;

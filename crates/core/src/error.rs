use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

/// Result alias that carries the crate-wide [`GazeError`] type.
pub type Result<T> = std::result::Result<T, GazeError>;

/// Wire tag attached to failed acknowledgements and pushed notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolError,
    StateError,
    DeviceError,
    AnalysisError,
    RetentionError,
    TransportError,
    ConfigError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::StateError => "StateError",
            ErrorKind::DeviceError => "DeviceError",
            ErrorKind::AnalysisError => "AnalysisError",
            ErrorKind::RetentionError => "RetentionError",
            ErrorKind::TransportError => "TransportError",
            ErrorKind::ConfigError => "ConfigError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Malformed or unknown request, rejected at the command boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,
    #[error("unknown verb `{0}`, try `help`")]
    UnknownVerb(String),
    #[error("{usage}")]
    Usage {
        verb: &'static str,
        usage: &'static str,
    },
}

/// A valid command that is illegal in the engine's current state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("already recording")]
    AlreadyRecording,
    #[error("already presenting {0}")]
    AlreadyPresenting(String),
    #[error("nothing is being presented")]
    NotPresenting,
    #[error("calibration required")]
    CalibrationRequired,
    #[error("`{verb}` is not allowed while {state}")]
    Busy { verb: &'static str, state: String },
}

/// Hardware open/read failure reported by a device adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open device: {0}")]
    Open(String),
    #[error("device read failed: {0}")]
    Read(String),
    #[error("device disconnected")]
    Disconnected,
}

/// Failure of the pluggable analysis function.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AnalysisError {
    #[error("analysis needs at least {need} frames, got {got}")]
    TooFewFrames { got: usize, need: usize },
    #[error("capture holds no valid gaze samples")]
    NoValidSamples,
    #[error("capture timestamps do not span a positive interval")]
    InvalidSampleRate,
    #[error("gaze trace carries no oscillation in the analysed band")]
    FlatSignal,
    #[error("spectral transform failed: {0}")]
    Fft(String),
}

/// Ephemeral store write or eviction failure.
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("failed to create store directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("failed to write record {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to evict record {path:?}: {source}")]
    Evict {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Authentication or delivery failure at the export bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("export is disabled: no trusted authority configured")]
    NotConfigured,
    #[error("peer `{subject}` is not issued by the trusted authority")]
    UntrustedPeer { subject: String },
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Startup-time configuration failure. The only fatal error class.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown device `{id}` (registered: {known})")]
    UnknownDevice { id: String, known: String },
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum GazeError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error(transparent)]
    Retention(#[from] RetentionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Free-form message for failures outside the taxonomy, such as a
    /// closed engine channel.
    #[error("{0}")]
    Message(String),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl GazeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Taxonomy tag for this error, if it belongs to one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            GazeError::Protocol(_) => Some(ErrorKind::ProtocolError),
            GazeError::State(_) => Some(ErrorKind::StateError),
            GazeError::Device(_) => Some(ErrorKind::DeviceError),
            GazeError::Analysis(_) => Some(ErrorKind::AnalysisError),
            GazeError::Retention(_) => Some(ErrorKind::RetentionError),
            GazeError::Transport(_) => Some(ErrorKind::TransportError),
            GazeError::Config(_) => Some(ErrorKind::ConfigError),
            GazeError::Message(_) | GazeError::Io(_) => None,
        }
    }
}

impl From<&str> for GazeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for GazeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_wrapped_errors() {
        let err: GazeError = StateError::AlreadyRecording.into();
        assert_eq!(err.kind(), Some(ErrorKind::StateError));
        assert_eq!(err.to_string(), "already recording");

        let err = GazeError::msg("engine channel closed");
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn unknown_device_lists_registered_ids() {
        let err = ConfigError::UnknownDevice {
            id: "fove".into(),
            known: "replay, synthetic".into(),
        };
        assert!(err.to_string().contains("replay, synthetic"));
    }
}

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration structure for the engine process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceConfig,
    pub control: ControlConfig,
    pub recorder: RecorderConfig,
    pub calibration: CalibrationConfig,
    pub store: StoreConfig,
    pub analysis: AnalysisConfig,
    pub export: ExportConfig,
    pub stimulus: StimulusConfig,
}

impl EngineConfig {
    /// Reads a JSON config file. Missing sections and fields keep their
    /// defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.ttl_secs == 0 {
            return Err(ConfigError::Invalid("store.ttl_secs must be positive".into()));
        }
        if !(self.device.rate_hz > 0.0) {
            return Err(ConfigError::Invalid("device.rate_hz must be positive".into()));
        }
        if !(self.stimulus.refresh_hz > 0.0) {
            return Err(ConfigError::Invalid(
                "stimulus.refresh_hz must be positive".into(),
            ));
        }
        if self.analysis.min_hz >= self.analysis.max_hz {
            return Err(ConfigError::Invalid(
                "analysis.min_hz must be below analysis.max_hz".into(),
            ));
        }
        if self.control.queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "control.queue_depth must be positive".into(),
            ));
        }
        if !is_loopback(&self.control.bind) {
            return Err(ConfigError::Invalid(format!(
                "control.bind must be a loopback address, got `{}`",
                self.control.bind
            )));
        }
        if let Some(bind) = &self.export.bind {
            if !is_loopback(bind) {
                return Err(ConfigError::Invalid(format!(
                    "export.bind must be a loopback address, got `{bind}`"
                )));
            }
            if self
                .export
                .terminator_secret
                .as_deref()
                .map_or(true, str::is_empty)
            {
                return Err(ConfigError::Invalid(
                    "export.bind requires export.terminator_secret".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Both listeners only ever face local processes; remote peers reach the
/// export side through the TLS terminator.
fn is_loopback(bind: &str) -> bool {
    match bind.parse::<SocketAddr>() {
        Ok(addr) => addr.ip().is_loopback(),
        Err(_) => bind
            .rsplit_once(':')
            .is_some_and(|(host, port)| host == "localhost" && port.parse::<u16>().is_ok()),
    }
}

/// Device selection. Read once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
    pub rate_hz: f64,
    /// Frames file for the `replay` adapter.
    pub replay_path: Option<PathBuf>,
    /// Makes the `synthetic` adapter fail after this many frames.
    pub fault_after: Option<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "synthetic".to_string(),
            rate_hz: 120.0,
            replay_path: None,
            fault_after: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub bind: String,
    pub queue_depth: usize,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:55365".to_string(),
            queue_depth: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Sealed buffers shorter than this are discarded without analysis.
    pub min_capture_frames: usize,
    pub require_calibration: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            min_capture_frames: 240,
            require_calibration: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub dwell_ms: u64,
    pub min_samples_per_point: usize,
}

impl CalibrationConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            dwell_ms: 1000,
            min_samples_per_point: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Parent for the per-process store directory. Defaults to the system
    /// temp dir.
    pub base_dir: Option<PathBuf>,
    pub ttl_secs: u64,
    pub reap_interval_ms: u64,
}

impl StoreConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms.max(1))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            ttl_secs: 300,
            reap_interval_ms: 1000,
        }
    }
}

/// Geometry and band limits used by the spectral analyser.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub screen_width_mm: f32,
    pub viewing_distance_mm: f32,
    pub min_hz: f32,
    pub max_hz: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            screen_width_mm: 120.0,
            viewing_distance_mm: 600.0,
            min_hz: 0.5,
            max_hz: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Fingerprint of the single authority whose certificates are accepted.
    /// Export is disabled while unset.
    pub trusted_authority: Option<String>,
    /// Loopback address the TLS terminator forwards authenticated requests
    /// to. No listener while unset.
    pub bind: Option<String>,
    /// Shared with the terminator, which sends it with every forwarded
    /// request. Peer identities arriving without it are not believed.
    pub terminator_secret: Option<String>,
    pub lease_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl ExportConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            trusted_authority: None,
            bind: None,
            terminator_secret: None,
            lease_ms: 10_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    pub refresh_hz: f64,
}

impl StimulusConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz)
    }
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self { refresh_hz: 60.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "store": { "ttl_secs": 60 }, "device": { "id": "replay" } }"#)
                .unwrap();

        assert_eq!(config.store.ttl_secs, 60);
        assert_eq!(config.store.reap_interval_ms, 1000);
        assert_eq!(config.device.id, "replay");
        assert_eq!(config.device.rate_hz, 120.0);
        assert_eq!(config.recorder.min_capture_frames, 240);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_ttl() {
        let mut config = EngineConfig::default();
        config.store.ttl_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn listeners_stay_on_loopback() {
        let mut config = EngineConfig::default();
        config.control.bind = "0.0.0.0:55365".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = EngineConfig::default();
        config.export.terminator_secret = Some("s3cret".into());
        config.export.bind = Some("0.0.0.0:7000".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.export.bind = Some("[::1]:7000".into());
        assert!(config.validate().is_ok());
        config.export.bind = Some("localhost:7000".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn export_listener_needs_a_terminator_secret() {
        let mut config = EngineConfig::default();
        config.export.bind = Some("127.0.0.1:7000".into());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.export.terminator_secret = Some(String::new());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.export.terminator_secret = Some("s3cret".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_reports_missing_file() {
        let err = EngineConfig::load(Path::new("/nonexistent/gazeguard.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

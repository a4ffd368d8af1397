use std::{
    collections::VecDeque,
    io::{BufRead, BufReader},
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    config::DeviceConfig,
    error::{ConfigError, DeviceError},
};

use super::{CaptureFrame, CaptureHandle, DeviceAdapter};

/// Plays back frames from a JSON-lines file, one [`CaptureFrame`] per line,
/// keeping the recorded inter-frame timing.
#[derive(Debug, Clone)]
pub struct ReplayDevice {
    path: PathBuf,
    paced: bool,
}

impl ReplayDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            paced: true,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn DeviceAdapter>, ConfigError> {
        let path = config.replay_path.clone().ok_or_else(|| {
            ConfigError::Invalid("device `replay` needs device.replay_path".into())
        })?;
        Ok(Box::new(Self::new(path)))
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn read_frames(&self) -> Result<VecDeque<CaptureFrame>, DeviceError> {
        let file = std::fs::File::open(&self.path)
            .map_err(|err| DeviceError::Open(format!("{}: {err}", self.path.display())))?;

        let mut frames = VecDeque::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|err| DeviceError::Open(err.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            let frame = serde_json::from_str(&line).map_err(|err| {
                DeviceError::Open(format!("line {}: {err}", number + 1))
            })?;
            frames.push_back(frame);
        }
        Ok(frames)
    }
}

impl DeviceAdapter for ReplayDevice {
    fn name(&self) -> &str {
        "replay"
    }

    fn open(&mut self) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        let frames = self.read_frames()?;
        let first = frames.front().map(|frame| frame.timestamp).unwrap_or(0.0);
        tracing::debug!(path = ?self.path, frames = frames.len(), "replay opened");

        Ok(Box::new(ReplayHandle {
            frames,
            first_timestamp: first,
            paced: self.paced,
            opened_at: Instant::now(),
        }))
    }
}

struct ReplayHandle {
    frames: VecDeque<CaptureFrame>,
    first_timestamp: f64,
    paced: bool,
    opened_at: Instant,
}

impl CaptureHandle for ReplayHandle {
    fn poll_frame(&mut self) -> Result<CaptureFrame, DeviceError> {
        let frame = self.frames.pop_front().ok_or(DeviceError::Disconnected)?;

        if self.paced {
            let offset = (frame.timestamp - self.first_timestamp).max(0.0);
            let due = self.opened_at + Duration::from_secs_f64(offset);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        Ok(frame)
    }

    fn close(&mut self) {
        self.frames.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn replays_frames_then_disconnects() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"timestamp":0.0,"gaze_x":0.4,"gaze_y":0.5,"valid":true}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"timestamp":0.01,"gaze_x":0.6,"gaze_y":0.5,"valid":false}}"#
        )
        .unwrap();

        let mut device = ReplayDevice::new(file.path()).unpaced();
        let mut handle = device.open().unwrap();

        assert_eq!(handle.poll_frame().unwrap().gaze_x, 0.4);
        assert!(!handle.poll_frame().unwrap().valid);
        assert_eq!(handle.poll_frame(), Err(DeviceError::Disconnected));
    }

    #[test]
    fn malformed_file_fails_to_open() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();

        let mut device = ReplayDevice::new(file.path());
        assert!(matches!(device.open().err(), Some(DeviceError::Open(_))));
    }
}

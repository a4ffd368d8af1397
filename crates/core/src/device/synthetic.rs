use std::{
    f64::consts::PI,
    time::{Duration, Instant},
};

use crate::{
    config::DeviceConfig,
    error::{ConfigError, DeviceError},
};

use super::{CaptureFrame, CaptureHandle, DeviceAdapter};

const BEAT_HZ: f64 = 2.5;
const SLOW_PHASE_SHARE: f64 = 0.8;
const SWEEP: f64 = 0.08;
const VERTICAL_DRIFT_HZ: f64 = 0.2;
const VERTICAL_SWEEP: f64 = 0.02;
/// Every Nth frame is flagged invalid, as if the eye had blinked.
const BLINK_EVERY: u64 = 97;

/// Deterministic nystagmus-like gaze generator: a slow horizontal drift
/// followed by a quick reset, repeating at a fixed beat.
#[derive(Debug, Clone)]
pub struct SyntheticDevice {
    rate_hz: f64,
    fault_after: Option<u64>,
    paced: bool,
}

impl SyntheticDevice {
    pub fn new(rate_hz: f64) -> Self {
        Self {
            rate_hz,
            fault_after: None,
            paced: true,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Box<dyn DeviceAdapter>, ConfigError> {
        if !(config.rate_hz > 0.0) {
            return Err(ConfigError::Invalid("device.rate_hz must be positive".into()));
        }
        let mut device = Self::new(config.rate_hz);
        device.fault_after = config.fault_after;
        Ok(Box::new(device))
    }

    /// Fails every read after `frames` successful ones.
    pub fn with_fault_after(mut self, frames: u64) -> Self {
        self.fault_after = Some(frames);
        self
    }

    /// Returns frames as fast as they are polled instead of at `rate_hz`.
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Gaze sample at frame `index`.
    pub fn sample(rate_hz: f64, index: u64) -> CaptureFrame {
        let t = index as f64 / rate_hz;
        let phase = (t * BEAT_HZ).fract();
        let x = if phase < SLOW_PHASE_SHARE {
            phase / SLOW_PHASE_SHARE
        } else {
            1.0 - (phase - SLOW_PHASE_SHARE) / (1.0 - SLOW_PHASE_SHARE)
        };

        CaptureFrame {
            timestamp: t,
            gaze_x: (0.5 + SWEEP * (x - 0.5)) as f32,
            gaze_y: (0.5 + VERTICAL_SWEEP * (2.0 * PI * VERTICAL_DRIFT_HZ * t).sin()) as f32,
            valid: index % BLINK_EVERY != BLINK_EVERY - 1,
        }
    }
}

impl DeviceAdapter for SyntheticDevice {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn open(&mut self) -> Result<Box<dyn CaptureHandle>, DeviceError> {
        Ok(Box::new(SyntheticHandle {
            rate_hz: self.rate_hz,
            fault_after: self.fault_after,
            paced: self.paced,
            index: 0,
            opened_at: Instant::now(),
            closed: false,
        }))
    }
}

struct SyntheticHandle {
    rate_hz: f64,
    fault_after: Option<u64>,
    paced: bool,
    index: u64,
    opened_at: Instant,
    closed: bool,
}

impl CaptureHandle for SyntheticHandle {
    fn poll_frame(&mut self) -> Result<CaptureFrame, DeviceError> {
        if self.closed {
            return Err(DeviceError::Disconnected);
        }
        if self.fault_after.is_some_and(|limit| self.index >= limit) {
            return Err(DeviceError::Read(format!(
                "synthetic fault after {} frames",
                self.index
            )));
        }

        if self.paced {
            let due = self.opened_at + Duration::from_secs_f64(self.index as f64 / self.rate_hz);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let frame = SyntheticDevice::sample(self.rate_hz, self.index);
        self.index += 1;
        Ok(frame)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_follow_rate() {
        let mut device = SyntheticDevice::new(120.0).unpaced();
        let mut handle = device.open().unwrap();

        let frames: Vec<_> = (0..240).map(|_| handle.poll_frame().unwrap()).collect();
        assert_eq!(frames[0].timestamp, 0.0);
        assert!((frames[120].timestamp - 1.0).abs() < 1e-9);
        assert!(frames.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert!(frames.iter().any(|frame| !frame.valid));
    }

    #[test]
    fn injected_fault_fires_on_schedule() {
        let mut device = SyntheticDevice::new(120.0).unpaced().with_fault_after(3);
        let mut handle = device.open().unwrap();

        for _ in 0..3 {
            handle.poll_frame().unwrap();
        }
        assert!(matches!(handle.poll_frame(), Err(DeviceError::Read(_))));
    }

    #[test]
    fn closed_handle_reports_disconnect() {
        let mut device = SyntheticDevice::new(60.0).unpaced();
        let mut handle = device.open().unwrap();
        handle.close();
        assert_eq!(handle.poll_frame(), Err(DeviceError::Disconnected));
    }
}

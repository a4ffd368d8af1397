use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{config::CalibrationConfig, device::CaptureFrame};

/// Normalised screen coordinate, (0, 0) top-left to (1, 1) bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenPoint {
    pub x: f32,
    pub y: f32,
}

const MARGIN: f32 = 0.1;
/// Fraction of the screen spanned between opposite calibration targets.
const TARGET_SPAN: f32 = 1.0 - 2.0 * MARGIN;

/// Center first, then the corners clockwise from top-left.
pub const CALIBRATION_POINTS: [ScreenPoint; 5] = [
    ScreenPoint { x: 0.5, y: 0.5 },
    ScreenPoint { x: MARGIN, y: MARGIN },
    ScreenPoint { x: 1.0 - MARGIN, y: MARGIN },
    ScreenPoint { x: 1.0 - MARGIN, y: 1.0 - MARGIN },
    ScreenPoint { x: MARGIN, y: 1.0 - MARGIN },
];

const CENTER: usize = 0;
const TOP_LEFT: usize = 1;
const TOP_RIGHT: usize = 2;
const BOTTOM_RIGHT: usize = 3;
const BOTTOM_LEFT: usize = 4;

/// Display bounds as seen in gaze space: how far gaze travels across the full
/// screen, and where gaze rests when looking at its center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationBounds {
    pub extent_x: f32,
    pub extent_y: f32,
    pub center_x: f32,
    pub center_y: f32,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalibrationError {
    #[error("target {index} collected {got} valid samples, need {need}")]
    TooFewSamples { index: usize, got: usize, need: usize },
    #[error("gaze did not separate between calibration targets")]
    Degenerate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    /// Still dwelling on the current target.
    Dwell,
    /// Moved on to the next target, which should now be shown.
    Target { index: usize, point: ScreenPoint },
    Finished(Result<CalibrationBounds, CalibrationError>),
}

/// One pass over the five calibration targets.
#[derive(Debug)]
pub struct CalibrationRun {
    dwell: Duration,
    min_samples: usize,
    index: usize,
    target_started: Instant,
    samples: Vec<Vec<(f32, f32)>>,
}

impl CalibrationRun {
    pub fn new(config: &CalibrationConfig, now: Instant) -> Self {
        Self {
            dwell: config.dwell(),
            min_samples: config.min_samples_per_point.max(1),
            index: 0,
            target_started: now,
            samples: vec![Vec::new(); CALIBRATION_POINTS.len()],
        }
    }

    pub fn current_target(&self) -> (usize, ScreenPoint) {
        (self.index, CALIBRATION_POINTS[self.index])
    }

    pub fn record(&mut self, frame: &CaptureFrame) {
        if frame.valid {
            self.samples[self.index].push((frame.gaze_x, frame.gaze_y));
        }
    }

    pub fn advance(&mut self, now: Instant) -> CalibrationStep {
        if now.saturating_duration_since(self.target_started) < self.dwell {
            return CalibrationStep::Dwell;
        }

        let got = self.samples[self.index].len();
        if got < self.min_samples {
            return CalibrationStep::Finished(Err(CalibrationError::TooFewSamples {
                index: self.index,
                got,
                need: self.min_samples,
            }));
        }

        if self.index + 1 < CALIBRATION_POINTS.len() {
            self.index += 1;
            self.target_started = now;
            let (index, point) = self.current_target();
            return CalibrationStep::Target { index, point };
        }

        CalibrationStep::Finished(self.bounds())
    }

    fn bounds(&self) -> Result<CalibrationBounds, CalibrationError> {
        let medians: Vec<(f32, f32)> = self
            .samples
            .iter()
            .map(|points| {
                let xs: Vec<f32> = points.iter().map(|(x, _)| *x).collect();
                let ys: Vec<f32> = points.iter().map(|(_, y)| *y).collect();
                (median(xs), median(ys))
            })
            .collect();

        let width = ((medians[TOP_RIGHT].0 - medians[TOP_LEFT].0)
            + (medians[BOTTOM_RIGHT].0 - medians[BOTTOM_LEFT].0))
            * 0.5;
        let height = ((medians[BOTTOM_LEFT].1 - medians[TOP_LEFT].1)
            + (medians[BOTTOM_RIGHT].1 - medians[TOP_RIGHT].1))
            * 0.5;

        let extent_x = width.abs() / TARGET_SPAN;
        let extent_y = height.abs() / TARGET_SPAN;
        if extent_x <= f32::EPSILON || extent_y <= f32::EPSILON {
            return Err(CalibrationError::Degenerate);
        }

        Ok(CalibrationBounds {
            extent_x,
            extent_y,
            center_x: medians[CENTER].0,
            center_y: medians[CENTER].1,
        })
    }
}

fn median(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) * 0.5
    } else {
        values[mid]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CalibrationConfig {
        CalibrationConfig {
            dwell_ms: 100,
            min_samples_per_point: 3,
        }
    }

    fn frame_at(point: ScreenPoint, gain: f32) -> CaptureFrame {
        CaptureFrame {
            timestamp: 0.0,
            gaze_x: 0.5 + (point.x - 0.5) * gain,
            gaze_y: 0.5 + (point.y - 0.5) * gain,
            valid: true,
        }
    }

    fn run_sequence(gain: f32, samples_per_point: usize) -> CalibrationStep {
        let start = Instant::now();
        let mut run = CalibrationRun::new(&config(), start);
        let mut now = start;

        loop {
            let (_, point) = run.current_target();
            for _ in 0..samples_per_point {
                run.record(&frame_at(point, gain));
            }
            now += Duration::from_millis(100);
            match run.advance(now) {
                CalibrationStep::Target { .. } => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn computes_extent_from_corner_medians() {
        let CalibrationStep::Finished(Ok(bounds)) = run_sequence(0.5, 5) else {
            panic!("calibration should succeed");
        };

        assert!((bounds.extent_x - 0.5).abs() < 1e-4);
        assert!((bounds.extent_y - 0.5).abs() < 1e-4);
        assert!((bounds.center_x - 0.5).abs() < 1e-4);
    }

    #[test]
    fn fails_when_a_target_is_missed() {
        let step = run_sequence(1.0, 2);
        assert!(matches!(
            step,
            CalibrationStep::Finished(Err(CalibrationError::TooFewSamples { index: 0, .. }))
        ));
    }

    #[test]
    fn fails_when_gaze_never_moves() {
        let step = run_sequence(0.0, 5);
        assert_eq!(step, CalibrationStep::Finished(Err(CalibrationError::Degenerate)));
    }

    #[test]
    fn dwells_before_moving_on() {
        let start = Instant::now();
        let mut run = CalibrationRun::new(&config(), start);
        assert_eq!(run.advance(start + Duration::from_millis(50)), CalibrationStep::Dwell);
    }
}

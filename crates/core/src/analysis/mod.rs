use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{
    calibration::CalibrationBounds, config::AnalysisConfig, error::AnalysisError,
    record::SealedBuffer,
};

const MIN_ANALYSIS_FRAMES: usize = 16;

/// De-identified summary of one sealed capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetric {
    pub frequency_hz: f32,
    pub amplitude_deg: f32,
    /// False when no calibration bounds were available; the amplitude then
    /// assumes gaze spans the whole normalised range.
    pub calibrated: bool,
}

/// The pluggable analysis step. Must not keep any part of the capture.
pub trait GazeAnalyzer: Send {
    fn analyze(
        &self,
        capture: &SealedBuffer,
        bounds: Option<&CalibrationBounds>,
    ) -> Result<DerivedMetric, AnalysisError>;
}

impl<F> GazeAnalyzer for F
where
    F: Fn(&SealedBuffer, Option<&CalibrationBounds>) -> Result<DerivedMetric, AnalysisError>
        + Send,
{
    fn analyze(
        &self,
        capture: &SealedBuffer,
        bounds: Option<&CalibrationBounds>,
    ) -> Result<DerivedMetric, AnalysisError> {
        self(capture, bounds)
    }
}

/// Periodogram-based analyser for the horizontal gaze trace.
///
/// Frequency is the strongest spectral peak inside the configured band.
/// Amplitude is the mean peak-to-trough excursion per oscillation cycle,
/// turned into visual degrees from the screen width and viewing distance.
#[derive(Debug, Clone)]
pub struct SpectralAnalyzer {
    config: AnalysisConfig,
}

impl SpectralAnalyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    fn dominant_frequency(&self, trace: &[f32], sample_rate: f32) -> Result<f32, AnalysisError> {
        let len = trace.len();
        let mut fft = FftResources::new(len);

        let mean = trace.iter().sum::<f32>() / len as f32;
        for (index, value) in trace.iter().enumerate() {
            fft.input[index] = (*value - mean) * hann_value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)
            .map_err(|err| AnalysisError::Fft(err.to_string()))?;

        let bin_hz = sample_rate / len as f32;
        let power: Vec<f32> = fft.spectrum.iter().map(|bin| bin.norm_sqr()).collect();

        let mut peak: Option<(usize, f32)> = None;
        let mut band_power = 0.0;
        for (index, value) in power.iter().enumerate().skip(1) {
            let hz = index as f32 * bin_hz;
            if hz < self.config.min_hz || hz > self.config.max_hz {
                continue;
            }
            band_power += value;
            if peak.map_or(true, |(_, best)| *value > best) {
                peak = Some((index, *value));
            }
        }

        let Some((index, _)) = peak else {
            return Err(AnalysisError::FlatSignal);
        };
        if band_power <= f32::EPSILON {
            return Err(AnalysisError::FlatSignal);
        }

        Ok((index as f32 + parabolic_offset(&power, index)) * bin_hz)
    }

    fn amplitude_degrees(&self, amplitude: f32, bounds: Option<&CalibrationBounds>) -> f32 {
        let extent = bounds
            .map(|bounds| bounds.extent_x)
            .filter(|extent| *extent > f32::EPSILON)
            .unwrap_or(1.0);
        let displacement_mm = amplitude / extent * self.config.screen_width_mm;
        let distance_mm = self.config.viewing_distance_mm.max(f32::EPSILON);
        (2.0 * (displacement_mm * 0.5 / distance_mm).atan()).to_degrees()
    }
}

impl GazeAnalyzer for SpectralAnalyzer {
    fn analyze(
        &self,
        capture: &SealedBuffer,
        bounds: Option<&CalibrationBounds>,
    ) -> Result<DerivedMetric, AnalysisError> {
        let frames = capture.frames();
        if frames.len() < MIN_ANALYSIS_FRAMES {
            return Err(AnalysisError::TooFewFrames {
                got: frames.len(),
                need: MIN_ANALYSIS_FRAMES,
            });
        }

        let (Some(first), Some(last)) = (frames.first(), frames.last()) else {
            return Err(AnalysisError::NoValidSamples);
        };
        let span = last.timestamp - first.timestamp;
        if !(span > 0.0) {
            return Err(AnalysisError::InvalidSampleRate);
        }
        let sample_rate = ((frames.len() - 1) as f64 / span) as f32;

        let trace = held_trace(capture)?;
        let frequency_hz = self.dominant_frequency(&trace, sample_rate)?;
        let amplitude = cycle_excursion(&trace, sample_rate, frequency_hz);

        Ok(DerivedMetric {
            frequency_hz,
            amplitude_deg: self.amplitude_degrees(amplitude, bounds),
            calibrated: bounds.is_some(),
        })
    }
}

/// Horizontal gaze with invalid frames holding the previous valid value.
fn held_trace(capture: &SealedBuffer) -> Result<Vec<f32>, AnalysisError> {
    let frames = capture.frames();
    let mut held = frames
        .iter()
        .find(|frame| frame.valid)
        .map(|frame| frame.gaze_x)
        .ok_or(AnalysisError::NoValidSamples)?;

    Ok(frames
        .iter()
        .map(|frame| {
            if frame.valid {
                held = frame.gaze_x;
            }
            held
        })
        .collect())
}

/// Mean of (max - min) over consecutive windows one oscillation long.
fn cycle_excursion(trace: &[f32], sample_rate: f32, frequency_hz: f32) -> f32 {
    let window = ((sample_rate / frequency_hz.max(f32::EPSILON)).round() as usize).clamp(2, trace.len());

    let excursions: Vec<f32> = trace
        .chunks_exact(window)
        .map(|cycle| {
            let (low, high) = cycle
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(low, high), value| {
                    (low.min(*value), high.max(*value))
                });
            high - low
        })
        .collect();

    if excursions.is_empty() {
        0.0
    } else {
        excursions.iter().sum::<f32>() / excursions.len() as f32
    }
}

fn parabolic_offset(power: &[f32], index: usize) -> f32 {
    if index == 0 || index + 1 >= power.len() {
        return 0.0;
    }
    let (a, b, c) = (power[index - 1], power[index], power[index + 1]);
    let denominator = a - 2.0 * b + c;
    if denominator.abs() <= f32::EPSILON {
        0.0
    } else {
        (0.5 * (a - c) / denominator).clamp(-0.5, 0.5)
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        let scratch = plan.make_scratch_vec();
        let spectrum = plan.make_output_vec();
        let input = plan.make_input_vec();
        Self {
            size,
            plan,
            scratch,
            spectrum,
            input,
        }
    }
}

impl fmt::Debug for FftResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FftResources")
            .field("size", &self.size)
            .finish()
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{CaptureFrame, SyntheticDevice},
        record::SealedBuffer,
        session::SessionId,
    };

    fn analyzer() -> SpectralAnalyzer {
        SpectralAnalyzer::new(AnalysisConfig::default())
    }

    fn sine_capture(hz: f32, peak_to_peak: f32, rate: f64, seconds: f64) -> SealedBuffer {
        let count = (rate * seconds) as usize;
        let frames = (0..count)
            .map(|index| {
                let t = index as f64 / rate;
                CaptureFrame {
                    timestamp: t,
                    gaze_x: 0.5 + 0.5 * peak_to_peak * (2.0 * PI * hz * t as f32).sin(),
                    gaze_y: 0.5,
                    valid: true,
                }
            })
            .collect();
        SealedBuffer::new(SessionId(1), frames)
    }

    #[test]
    fn finds_sine_frequency_and_amplitude() {
        let capture = sine_capture(3.0, 0.2, 120.0, 10.0);
        let metric = analyzer().analyze(&capture, None).unwrap();

        assert!((metric.frequency_hz - 3.0).abs() < 0.05, "{metric:?}");
        // 0.2 of a 120 mm screen seen from 600 mm.
        let expected = (2.0 * (12.0_f32 / 600.0).atan()).to_degrees();
        assert!((metric.amplitude_deg - expected).abs() < 0.1, "{metric:?}");
        assert!(!metric.calibrated);
    }

    #[test]
    fn calibration_extent_scales_amplitude() {
        let capture = sine_capture(3.0, 0.2, 120.0, 10.0);
        let bounds = CalibrationBounds {
            extent_x: 0.5,
            extent_y: 0.5,
            center_x: 0.5,
            center_y: 0.5,
        };

        let uncalibrated = analyzer().analyze(&capture, None).unwrap();
        let calibrated = analyzer().analyze(&capture, Some(&bounds)).unwrap();

        assert!(calibrated.calibrated);
        assert!(calibrated.amplitude_deg > uncalibrated.amplitude_deg * 1.9);
    }

    #[test]
    fn recovers_synthetic_beat() {
        let frames = (0..3600).map(|index| SyntheticDevice::sample(120.0, index)).collect();
        let capture = SealedBuffer::new(SessionId(2), frames);

        let metric = analyzer().analyze(&capture, None).unwrap();
        assert!((metric.frequency_hz - 2.5).abs() < 0.05, "{metric:?}");
        assert!(metric.amplitude_deg > 0.5 && metric.amplitude_deg < 1.5, "{metric:?}");
    }

    #[test]
    fn rejects_flat_and_invalid_captures() {
        let flat = sine_capture(3.0, 0.0, 120.0, 2.0);
        assert_eq!(analyzer().analyze(&flat, None), Err(AnalysisError::FlatSignal));

        let blind: Vec<CaptureFrame> = (0..64)
            .map(|index| CaptureFrame {
                timestamp: index as f64 / 120.0,
                gaze_x: 0.0,
                gaze_y: 0.0,
                valid: false,
            })
            .collect();
        let blind = SealedBuffer::new(SessionId(3), blind);
        assert_eq!(analyzer().analyze(&blind, None), Err(AnalysisError::NoValidSamples));
    }

    #[test]
    fn rejects_short_or_frozen_clocks() {
        let short = sine_capture(3.0, 0.2, 120.0, 0.05);
        assert!(matches!(
            analyzer().analyze(&short, None),
            Err(AnalysisError::TooFewFrames { .. })
        ));

        let frozen: Vec<CaptureFrame> = (0..32)
            .map(|_| CaptureFrame {
                timestamp: 1.0,
                gaze_x: 0.5,
                gaze_y: 0.5,
                valid: true,
            })
            .collect();
        let frozen = SealedBuffer::new(SessionId(4), frozen);
        assert_eq!(
            analyzer().analyze(&frozen, None),
            Err(AnalysisError::InvalidSampleRate)
        );
    }

    #[test]
    fn closures_are_analyzers() {
        let fixed = |_: &SealedBuffer, _: Option<&CalibrationBounds>| {
            Ok::<_, AnalysisError>(DerivedMetric {
                frequency_hz: 1.0,
                amplitude_deg: 2.0,
                calibrated: false,
            })
        };
        let capture = sine_capture(3.0, 0.2, 120.0, 1.0);
        assert_eq!(fixed.analyze(&capture, None).unwrap().amplitude_deg, 2.0);
    }

    #[test]
    fn hann_window_is_zero_at_edges() {
        assert!(hann_value(0, 64).abs() < 1e-6);
        assert!((hann_value(63, 64)).abs() < 1e-6);
        assert_eq!(hann_value(0, 1), 1.0);
    }
}

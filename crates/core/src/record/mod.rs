use std::{fmt, time::Instant};

use crate::{
    analysis::{DerivedMetric, GazeAnalyzer},
    calibration::CalibrationBounds,
    config::RecorderConfig,
    device::CaptureFrame,
    error::{AnalysisError, RetentionError, StateError},
    session::SessionId,
    store::{EphemeralStore, ReapReport},
};

/// Frames of one session in arrival order. Append-only until sealed.
#[derive(Debug)]
pub struct CaptureBuffer {
    session: SessionId,
    frames: Vec<CaptureFrame>,
}

impl CaptureBuffer {
    fn new(session: SessionId) -> Self {
        Self {
            session,
            frames: Vec::new(),
        }
    }

    fn seal(self) -> SealedBuffer {
        SealedBuffer {
            session: self.session,
            frames: self.frames,
        }
    }
}

/// Immutable capture handed to analysis and then to the store.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBuffer {
    session: SessionId,
    frames: Vec<CaptureFrame>,
}

impl SealedBuffer {
    pub fn new(session: SessionId, frames: Vec<CaptureFrame>) -> Self {
        Self { session, frames }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn frames(&self) -> &[CaptureFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Fewer frames than the minimum viable capture.
    TooShort,
    /// The device failed mid-capture.
    DeviceFault,
}

/// What sealing did with the active buffer.
#[derive(Debug)]
pub enum SealReport {
    Stored {
        session: SessionId,
        frames: usize,
        derived: Result<DerivedMetric, AnalysisError>,
        retention: Option<RetentionError>,
    },
    Discarded {
        session: SessionId,
        frames: usize,
        reason: DiscardReason,
    },
}

/// Sole owner of the active capture buffer and of the ephemeral store.
/// Only derived metrics leave it.
pub struct Recorder {
    settings: RecorderConfig,
    analyzer: Box<dyn GazeAnalyzer>,
    store: EphemeralStore,
    active: Option<CaptureBuffer>,
}

impl Recorder {
    pub fn new(
        settings: RecorderConfig,
        analyzer: Box<dyn GazeAnalyzer>,
        store: EphemeralStore,
    ) -> Self {
        Self {
            settings,
            analyzer,
            store,
            active: None,
        }
    }

    pub fn settings(&self) -> &RecorderConfig {
        &self.settings
    }

    pub fn start(&mut self, session: SessionId) -> Result<(), StateError> {
        if self.active.is_some() {
            return Err(StateError::AlreadyRecording);
        }
        tracing::info!(%session, "capture buffer opened");
        self.active = Some(CaptureBuffer::new(session));
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub fn frame_count(&self) -> usize {
        self.active.as_ref().map_or(0, |buffer| buffer.frames.len())
    }

    /// Appends a frame to the active buffer. Frames arriving with no buffer
    /// open belong to no session and are dropped.
    pub fn on_frame(&mut self, frame: CaptureFrame) -> bool {
        match self.active.as_mut() {
            Some(buffer) => {
                buffer.frames.push(frame);
                true
            }
            None => false,
        }
    }

    /// Seals the active buffer. Short captures are thrown away without being
    /// analysed; everything else is analysed and stored under TTL, even when
    /// analysis fails.
    pub fn seal(&mut self, bounds: Option<&CalibrationBounds>, now: Instant) -> Option<SealReport> {
        let sealed = self.active.take()?.seal();
        let session = sealed.session();
        let frames = sealed.len();

        if frames < self.settings.min_capture_frames {
            tracing::info!(%session, frames, min = self.settings.min_capture_frames, "capture too short, discarded");
            return Some(SealReport::Discarded {
                session,
                frames,
                reason: DiscardReason::TooShort,
            });
        }

        let derived = self.analyzer.analyze(&sealed, bounds);
        match &derived {
            Ok(metric) => tracing::info!(
                %session,
                frames,
                frequency_hz = metric.frequency_hz,
                amplitude_deg = metric.amplitude_deg,
                calibrated = metric.calibrated,
                "capture analysed"
            ),
            Err(err) => tracing::warn!(%session, frames, error = %err, "analysis failed, raw capture kept under TTL"),
        }

        let retention = self
            .store
            .insert(sealed, derived.as_ref().ok().copied(), now)
            .err();

        Some(SealReport::Stored {
            session,
            frames,
            derived,
            retention,
        })
    }

    /// Drops the active buffer without analysis or storage.
    pub fn discard(&mut self) -> Option<SealReport> {
        let buffer = self.active.take()?;
        tracing::warn!(session = %buffer.session, frames = buffer.frames.len(), "capture discarded after device fault");
        Some(SealReport::Discarded {
            session: buffer.session,
            frames: buffer.frames.len(),
            reason: DiscardReason::DeviceFault,
        })
    }

    pub fn reap(&mut self, now: Instant) -> ReapReport {
        self.store.reap(now)
    }

    pub fn store(&self) -> &EphemeralStore {
        &self.store
    }
}

impl fmt::Debug for Recorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recorder")
            .field("settings", &self.settings)
            .field("store", &self.store.path())
            .field("active_frames", &self.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{analysis::SpectralAnalyzer, config::{AnalysisConfig, StoreConfig}, device::SyntheticDevice};

    fn recorder(dir: &std::path::Path, min_capture_frames: usize) -> Recorder {
        let store = EphemeralStore::open(&StoreConfig {
            base_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        Recorder::new(
            RecorderConfig {
                min_capture_frames,
                require_calibration: false,
            },
            Box::new(SpectralAnalyzer::new(AnalysisConfig::default())),
            store,
        )
    }

    #[test]
    fn drops_frames_outside_a_recording() {
        let base = tempfile::tempdir().unwrap();
        let mut recorder = recorder(base.path(), 10);
        assert!(!recorder.on_frame(SyntheticDevice::sample(120.0, 0)));
        assert!(recorder.seal(None, Instant::now()).is_none());
    }

    #[test]
    fn refuses_a_second_buffer() {
        let base = tempfile::tempdir().unwrap();
        let mut recorder = recorder(base.path(), 10);
        recorder.start(SessionId(1)).unwrap();
        assert_eq!(recorder.start(SessionId(2)), Err(StateError::AlreadyRecording));
    }

    #[test]
    fn short_captures_are_discarded_unanalysed() {
        let base = tempfile::tempdir().unwrap();
        let mut recorder = recorder(base.path(), 240);
        let now = Instant::now();
        recorder.start(SessionId(1)).unwrap();
        for index in 0..100 {
            recorder.on_frame(SyntheticDevice::sample(120.0, index));
        }

        let report = recorder.seal(None, now).unwrap();
        assert!(matches!(
            report,
            SealReport::Discarded {
                frames: 100,
                reason: DiscardReason::TooShort,
                ..
            }
        ));
        assert!(!recorder.store().contains(SessionId(1), now));
    }

    #[test]
    fn sealed_capture_is_analysed_and_stored() {
        let base = tempfile::tempdir().unwrap();
        let mut recorder = recorder(base.path(), 240);
        let now = Instant::now();
        recorder.start(SessionId(9)).unwrap();
        for index in 0..1200 {
            recorder.on_frame(SyntheticDevice::sample(120.0, index));
        }

        let Some(SealReport::Stored { frames, derived, retention, .. }) = recorder.seal(None, now)
        else {
            panic!("capture should be stored");
        };
        assert_eq!(frames, 1200);
        assert!(retention.is_none());
        let metric = derived.unwrap();
        assert_eq!(recorder.store().derived(SessionId(9), now), Some(metric));

        let report = recorder.reap(now + Duration::from_secs(300));
        assert_eq!(report.purged, vec![SessionId(9)]);
    }

    #[test]
    fn failed_analysis_still_retains_raw_capture() {
        let base = tempfile::tempdir().unwrap();
        let store = EphemeralStore::open(&StoreConfig {
            base_dir: Some(base.path().to_path_buf()),
            ..Default::default()
        })
        .unwrap();
        let failing = |_: &SealedBuffer, _: Option<&CalibrationBounds>| {
            Err::<DerivedMetric, _>(AnalysisError::FlatSignal)
        };
        let mut recorder = Recorder::new(RecorderConfig::default(), Box::new(failing), store);
        let now = Instant::now();

        recorder.start(SessionId(4)).unwrap();
        for index in 0..300 {
            recorder.on_frame(SyntheticDevice::sample(120.0, index));
        }

        let Some(SealReport::Stored { derived, .. }) = recorder.seal(None, now) else {
            panic!("capture should be stored");
        };
        assert_eq!(derived, Err(AnalysisError::FlatSignal));
        assert!(recorder.store().contains(SessionId(4), now));
        assert_eq!(recorder.store().derived(SessionId(4), now), None);
    }

    #[test]
    fn device_fault_discards_regardless_of_length() {
        let base = tempfile::tempdir().unwrap();
        let mut recorder = recorder(base.path(), 10);
        recorder.start(SessionId(3)).unwrap();
        for index in 0..1200 {
            recorder.on_frame(SyntheticDevice::sample(120.0, index));
        }

        let report = recorder.discard().unwrap();
        assert!(matches!(
            report,
            SealReport::Discarded {
                frames: 1200,
                reason: DiscardReason::DeviceFault,
                ..
            }
        ));
        assert!(!recorder.is_recording());
    }
}

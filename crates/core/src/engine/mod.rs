//! The privileged state machine.
//!
//! Everything here is synchronous and takes the current time as an argument;
//! [`runtime`] owns the clock and the event sources. Each entry point runs to
//! completion, draining the bus before it returns, so no handler ever
//! observes a half-applied transition.

pub mod runtime;

use std::{fmt, time::Instant};

use crate::{
    analysis::SpectralAnalyzer,
    bus::{Delivery, Event, EventBus, Subscriber, ENGINE_ROUTES},
    calibration::{CalibrationBounds, CalibrationRun, CalibrationStep},
    config::{CalibrationConfig, EngineConfig},
    device::{DeviceControl, DeviceMessage},
    error::{ErrorKind, GazeError, ProtocolError, RetentionError, StateError, TransportError},
    export::{ExportBridge, ExportRequest, ExportResponse, PeerCertificate},
    protocol::{self, Acknowledgement, Command, Notice},
    record::{DiscardReason, Recorder, SealReport},
    session::{SessionId, SessionRegistry},
    stimulus::{HeadlessStimulus, Paradigm, StimulusDescriptor, StimulusDriver, StimulusEvent},
    store::EphemeralStore,
};

/// Externally visible engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Calibrating,
    Presenting(Paradigm),
    Recording(Paradigm),
    Draining,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => f.write_str("idle"),
            EngineState::Calibrating => f.write_str("calibrating"),
            EngineState::Presenting(paradigm) => write!(f, "presenting({paradigm})"),
            EngineState::Recording(paradigm) => write!(f, "recording({paradigm})"),
            EngineState::Draining => f.write_str("draining"),
        }
    }
}

#[derive(Debug)]
enum Mode {
    Idle,
    Calibrating { run: CalibrationRun, finished: bool },
    Presenting(Paradigm),
    Recording { paradigm: Paradigm, deadline: Instant },
    Draining,
}

impl Mode {
    fn state(&self) -> EngineState {
        match self {
            Mode::Idle => EngineState::Idle,
            Mode::Calibrating { .. } => EngineState::Calibrating,
            Mode::Presenting(paradigm) => EngineState::Presenting(*paradigm),
            Mode::Recording { paradigm, .. } => EngineState::Recording(*paradigm),
            Mode::Draining => EngineState::Draining,
        }
    }

    fn wants_frames(&self) -> bool {
        matches!(self, Mode::Calibrating { .. } | Mode::Recording { .. })
    }
}

/// Collaborators an engine is assembled from.
pub struct EngineParts {
    pub recorder: Recorder,
    pub bridge: ExportBridge,
    pub stimulus: Box<dyn StimulusDriver>,
    pub sessions: SessionRegistry,
    pub device: DeviceControl,
    pub calibration: CalibrationConfig,
}

pub struct Engine {
    mode: Mode,
    session: Option<SessionId>,
    bounds: Option<CalibrationBounds>,
    recorder: Recorder,
    bridge: ExportBridge,
    bus: EventBus,
    stimulus: Box<dyn StimulusDriver>,
    sessions: SessionRegistry,
    device: DeviceControl,
    calibration: CalibrationConfig,
    notices: Vec<Notice>,
    shutting_down: bool,
}

impl Engine {
    /// Builds an engine with the default analyser, the headless stimulus
    /// driver and random session ids. Opens the ephemeral store.
    pub fn new(config: &EngineConfig, device: DeviceControl) -> Result<Self, RetentionError> {
        let store = EphemeralStore::open(&config.store)?;
        let analyzer = SpectralAnalyzer::new(config.analysis.clone());
        Ok(Self::from_parts(EngineParts {
            recorder: Recorder::new(config.recorder.clone(), Box::new(analyzer), store),
            bridge: ExportBridge::new(&config.export),
            stimulus: Box::new(HeadlessStimulus::new(config.stimulus.frame_interval())),
            sessions: SessionRegistry::random(config.store.ttl()),
            device,
            calibration: config.calibration.clone(),
        }))
    }

    pub fn from_parts(parts: EngineParts) -> Self {
        parts.device.set_streaming(false);
        Self {
            mode: Mode::Idle,
            session: None,
            bounds: None,
            recorder: parts.recorder,
            bridge: parts.bridge,
            bus: EventBus::new(ENGINE_ROUTES),
            stimulus: parts.stimulus,
            sessions: parts.sessions,
            device: parts.device,
            calibration: parts.calibration,
            notices: Vec::new(),
            shutting_down: false,
        }
    }

    /// Replaces the session id source.
    pub fn with_sessions(mut self, sessions: SessionRegistry) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn state(&self) -> EngineState {
        self.mode.state()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn bounds(&self) -> Option<CalibrationBounds> {
        self.bounds
    }

    pub fn store(&self) -> &EphemeralStore {
        self.recorder.store()
    }

    pub fn bridge(&self) -> &ExportBridge {
        &self.bridge
    }

    /// Frames in the open capture buffer, if any.
    pub fn buffered_frames(&self) -> usize {
        self.recorder.frame_count()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// When the running recording must be sealed.
    pub fn next_deadline(&self) -> Option<Instant> {
        match &self.mode {
            Mode::Recording { deadline, .. } => Some(*deadline),
            _ => None,
        }
    }

    /// When the oldest stored record expires and must be reaped.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.recorder.store().next_deadline()
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Executes one validated command and produces its acknowledgement.
    pub fn handle(&mut self, seq: u64, command: Command, now: Instant) -> Acknowledgement {
        tracing::debug!(seq, verb = command.verb(), state = %self.state(), "command received");
        let result = self.execute(command, now);
        self.pump(now);
        match result {
            Ok(None) => Acknowledgement::ok(seq),
            Ok(Some(payload)) => Acknowledgement::ok_with(seq, payload),
            Err(err) => {
                tracing::info!(seq, verb = command.verb(), error = %err, "command refused");
                Acknowledgement::failed(seq, &err)
            }
        }
    }

    fn execute(&mut self, command: Command, now: Instant) -> Result<Option<String>, GazeError> {
        match command {
            Command::Show(paradigm) => self.show(paradigm, now).map(|()| None),
            Command::Calibrate => self.calibrate(now).map(|()| None),
            Command::Record(duration) => {
                let deadline = now.checked_add(duration).ok_or(ProtocolError::Usage {
                    verb: "record",
                    usage: protocol::RECORD_USAGE,
                })?;
                self.record(deadline, now).map(|()| None)
            }
            Command::Stop => {
                self.stop(now);
                Ok(None)
            }
            Command::Status => Ok(Some(self.status(now))),
            Command::Help => Ok(Some(protocol::help_text())),
            Command::Exit => {
                self.stop(now);
                self.shutting_down = true;
                Ok(Some("shutting down".to_string()))
            }
        }
    }

    fn show(&mut self, paradigm: Paradigm, now: Instant) -> Result<(), GazeError> {
        match self.state() {
            EngineState::Idle => {}
            EngineState::Presenting(current) => {
                return Err(StateError::AlreadyPresenting(current.to_string()).into())
            }
            state => return Err(busy("show", state)),
        }

        let session = self.sessions.issue(now);
        tracing::info!(%session, %paradigm, "session opened");
        self.session = Some(session);
        self.stimulus
            .start(&StimulusDescriptor::Paradigm(paradigm), now);
        self.enter(Mode::Presenting(paradigm));
        Ok(())
    }

    fn calibrate(&mut self, now: Instant) -> Result<(), GazeError> {
        match self.state() {
            EngineState::Idle | EngineState::Presenting(_) => {}
            state => return Err(busy("calibrate", state)),
        }

        self.stimulus.stop();
        self.close_session();
        let run = CalibrationRun::new(&self.calibration, now);
        let (index, point) = run.current_target();
        self.stimulus
            .start(&StimulusDescriptor::CalibrationTarget { index, point }, now);
        self.enter(Mode::Calibrating {
            run,
            finished: false,
        });
        Ok(())
    }

    fn record(&mut self, deadline: Instant, now: Instant) -> Result<(), GazeError> {
        let paradigm = match self.state() {
            EngineState::Presenting(paradigm) => paradigm,
            EngineState::Idle => return Err(StateError::NotPresenting.into()),
            EngineState::Recording(_) => return Err(StateError::AlreadyRecording.into()),
            state => return Err(busy("record", state)),
        };
        if self.recorder.settings().require_calibration && self.bounds.is_none() {
            return Err(StateError::CalibrationRequired.into());
        }

        let session = match self.session {
            Some(session) => session,
            None => {
                let session = self.sessions.issue(now);
                self.session = Some(session);
                session
            }
        };
        self.recorder.start(session)?;
        self.enter(Mode::Recording { paradigm, deadline });
        Ok(())
    }

    /// Cancels whatever is running. A no-op when idle.
    fn stop(&mut self, now: Instant) {
        match self.state() {
            EngineState::Idle => {}
            EngineState::Recording(_) => self.finish_recording(now),
            EngineState::Calibrating => {
                tracing::info!("calibration cancelled, previous bounds kept");
                self.stimulus.stop();
                self.enter(Mode::Idle);
            }
            EngineState::Presenting(_) | EngineState::Draining => {
                self.stimulus.stop();
                self.close_session();
                self.enter(Mode::Idle);
            }
        }
    }

    /// Seals the active capture and returns to idle.
    fn finish_recording(&mut self, now: Instant) {
        self.enter(Mode::Draining);
        self.stimulus.stop();
        if let Some(report) = self.recorder.seal(self.bounds.as_ref(), now) {
            self.publish_seal(report, now);
        }
        self.close_session();
        self.enter(Mode::Idle);
    }

    fn publish_seal(&mut self, report: SealReport, now: Instant) {
        match report {
            SealReport::Stored {
                session,
                frames,
                derived,
                retention,
            } => {
                self.sessions.refresh(session, now);
                let metric = match derived {
                    Ok(metric) => Some(metric),
                    Err(err) => {
                        self.bus.publish(Event::AnalysisFailed {
                            session,
                            reason: err.to_string(),
                        });
                        None
                    }
                };
                if let Some(err) = retention {
                    self.bus.publish(Event::RetentionFailed {
                        detail: err.to_string(),
                    });
                }
                self.bus.publish(Event::CaptureStored {
                    session,
                    frames,
                    derived: metric,
                });
            }
            SealReport::Discarded {
                session,
                frames,
                reason,
            } => self.bus.publish(Event::CaptureDiscarded {
                session,
                frames,
                reason,
            }),
        }
    }

    fn status(&self, now: Instant) -> String {
        let session = self
            .session
            .map_or_else(|| "none".to_string(), |session| session.to_string());
        format!(
            "state={} session={} calibrated={} records={} exports={}",
            self.state(),
            session,
            self.bounds.is_some(),
            self.store().live(now),
            self.bridge.pending()
        )
    }

    /// Takes one message from the device worker.
    pub fn on_device(&mut self, message: DeviceMessage, now: Instant) {
        match message {
            DeviceMessage::Frame(frame) => self.bus.publish(Event::FrameReady(frame)),
            DeviceMessage::Fault { error, stream } if stream != self.device.stream() => {
                tracing::debug!(%error, stream, "ignoring fault from an earlier stream");
            }
            DeviceMessage::Fault { error, .. } => self.bus.publish(Event::DeviceFault(error)),
        }
        self.pump(now);
    }

    /// Advances the stimulus timeline.
    pub fn on_tick(&mut self, now: Instant) {
        for event in self.stimulus.advance(now) {
            match event {
                StimulusEvent::FrameRendered => self.bus.publish(Event::StimulusTick),
                StimulusEvent::TaskDone => self.bus.publish(Event::TaskDone),
            }
        }
        self.pump(now);
    }

    /// Seals the recording once its duration has elapsed.
    pub fn on_deadline(&mut self, now: Instant) {
        if self.next_deadline().is_some_and(|deadline| now >= deadline) {
            tracing::info!("recording duration elapsed");
            self.finish_recording(now);
        }
        self.pump(now);
    }

    /// One reaper sweep over the store and the export queue.
    pub fn reap(&mut self, now: Instant) {
        let report = self.recorder.reap(now);
        for session in report.purged {
            self.bus.publish(Event::RecordPurged { session });
        }
        for failure in report.failures {
            self.bus.publish(Event::RetentionFailed {
                detail: failure.to_string(),
            });
        }
        for expired in self.bridge.sweep(now) {
            self.bus.publish(Event::ExportExpired {
                session: expired.session,
                last_error: expired.last_error,
            });
        }
        self.pump(now);
    }

    /// Serves one request from the export side.
    pub fn on_export(
        &mut self,
        peer: &PeerCertificate,
        request: &ExportRequest,
        now: Instant,
    ) -> ExportResponse {
        self.bridge.handle(peer, request, self.recorder.store(), now)
    }

    /// The response to an export poll never reached the poller.
    pub fn on_export_failure(&mut self, session: SessionId, err: TransportError, now: Instant) {
        self.bridge.delivery_failed(session, err, now);
    }

    fn enter(&mut self, next: Mode) {
        let from = self.mode.state();
        self.mode = next;
        self.device.set_streaming(self.mode.wants_frames());
        tracing::info!(%from, to = %self.mode.state(), "engine transition");
    }

    fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(%session, "session closed");
        }
    }

    fn pump(&mut self, now: Instant) {
        while let Some(Delivery { event, subscribers }) = self.bus.next() {
            for subscriber in subscribers {
                match subscriber {
                    Subscriber::Recorder => self.recorder_on(&event),
                    Subscriber::Calibrator => self.calibrator_on(&event, now),
                    Subscriber::Engine => self.engine_on(&event, now),
                    Subscriber::ExportBridge => self.bridge_on(&event),
                    Subscriber::ControlSurface => self.surface_on(&event),
                }
            }
        }
    }

    fn recorder_on(&mut self, event: &Event) {
        if let (Event::FrameReady(frame), Mode::Recording { .. }) = (event, &self.mode) {
            self.recorder.on_frame(*frame);
        }
    }

    fn calibrator_on(&mut self, event: &Event, now: Instant) {
        let Mode::Calibrating { run, finished } = &mut self.mode else {
            return;
        };
        if *finished {
            return;
        }
        match event {
            Event::FrameReady(frame) => run.record(frame),
            Event::StimulusTick => match run.advance(now) {
                CalibrationStep::Dwell => {}
                CalibrationStep::Target { index, point } => {
                    tracing::debug!(index, "next calibration target");
                    self.stimulus
                        .start(&StimulusDescriptor::CalibrationTarget { index, point }, now);
                }
                CalibrationStep::Finished(result) => {
                    *finished = true;
                    self.bus
                        .publish(Event::CalibrationFinished(result.map_err(|err| err.to_string())));
                }
            },
            _ => {}
        }
    }

    fn engine_on(&mut self, event: &Event, now: Instant) {
        match (event, self.state()) {
            (Event::TaskDone, EngineState::Presenting(paradigm)) => {
                tracing::info!(%paradigm, "task finished");
                self.close_session();
                self.enter(Mode::Idle);
            }
            (Event::TaskDone, EngineState::Recording(_)) => self.finish_recording(now),
            (Event::DeviceFault(err), EngineState::Recording(_)) => {
                tracing::warn!(error = %err, "device fault, session aborted");
                self.stimulus.stop();
                if let Some(report) = self.recorder.discard() {
                    self.publish_seal(report, now);
                }
                self.close_session();
                self.enter(Mode::Idle);
            }
            (Event::DeviceFault(err), EngineState::Calibrating) => {
                tracing::warn!(error = %err, "device fault, calibration aborted");
                self.stimulus.stop();
                self.enter(Mode::Idle);
            }
            (Event::CalibrationFinished(result), EngineState::Calibrating) => {
                match result {
                    Ok(bounds) => {
                        tracing::info!(?bounds, "calibration stored");
                        self.bounds = Some(*bounds);
                    }
                    Err(reason) => tracing::warn!(%reason, "calibration failed, previous bounds kept"),
                }
                self.stimulus.stop();
                self.enter(Mode::Idle);
            }
            _ => {}
        }
    }

    fn bridge_on(&mut self, event: &Event) {
        match event {
            Event::CaptureStored {
                session,
                derived: Some(_),
                ..
            } => {
                if let Some(deadline) = self.recorder.store().deadline(*session) {
                    self.bridge.enqueue(*session, deadline);
                }
            }
            Event::RecordPurged { session } => {
                if let Some(expired) = self.bridge.discard(*session) {
                    self.bus.publish(Event::ExportExpired {
                        session: expired.session,
                        last_error: expired.last_error,
                    });
                }
            }
            _ => {}
        }
    }

    fn surface_on(&mut self, event: &Event) {
        let notice = match event {
            Event::TaskDone => Notice::event("task-done", ""),
            Event::DeviceFault(err) => Notice::error(ErrorKind::DeviceError, err.to_string()),
            Event::CaptureStored {
                session,
                frames,
                derived: Some(metric),
            } => Notice::event(
                "sealed",
                format!(
                    "session={session} frames={frames} frequency_hz={:.2} amplitude_deg={:.2} calibrated={}",
                    metric.frequency_hz, metric.amplitude_deg, metric.calibrated
                ),
            ),
            Event::CaptureStored {
                session,
                frames,
                derived: None,
            } => Notice::event("sealed", format!("session={session} frames={frames} metric=none")),
            Event::CaptureDiscarded {
                session,
                frames,
                reason,
            } => {
                let reason = match reason {
                    DiscardReason::TooShort => "too-short",
                    DiscardReason::DeviceFault => "device-fault",
                };
                Notice::event(
                    "discarded",
                    format!("session={session} frames={frames} reason={reason}"),
                )
            }
            Event::AnalysisFailed { session, reason } => {
                Notice::error(ErrorKind::AnalysisError, format!("session {session}: {reason}"))
            }
            Event::CalibrationFinished(Ok(bounds)) => Notice::event(
                "calibrated",
                format!(
                    "extent_x={:.3} extent_y={:.3} center_x={:.3} center_y={:.3}",
                    bounds.extent_x, bounds.extent_y, bounds.center_x, bounds.center_y
                ),
            ),
            Event::CalibrationFinished(Err(reason)) => {
                Notice::event("calibration-failed", reason.clone())
            }
            Event::RecordPurged { session } => Notice::event("purged", format!("session={session}")),
            Event::ExportExpired {
                session,
                last_error,
            } => {
                let detail = match last_error {
                    Some(err) => format!("export of session {session} expired: {err}"),
                    None => format!("export of session {session} expired unpolled"),
                };
                Notice::error(ErrorKind::TransportError, detail)
            }
            Event::RetentionFailed { detail } => {
                Notice::error(ErrorKind::RetentionError, detail.clone())
            }
            Event::FrameReady(_) | Event::StimulusTick => return,
        };
        self.notices.push(notice);
    }
}

fn busy(verb: &'static str, state: EngineState) -> GazeError {
    StateError::Busy {
        verb,
        state: state.to_string(),
    }
    .into()
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state())
            .field("session", &self.session)
            .field("calibrated", &self.bounds.is_some())
            .field("recorder", &self.recorder)
            .field("bridge", &self.bridge)
            .finish()
    }
}

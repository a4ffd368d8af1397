//! Stimulus paradigms and the driver contract the engine presents them
//! through. Rendering is the driver's business; the engine only sees
//! descriptors going in and `FrameRendered`/`TaskDone` coming out.

use std::{
    fmt,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::calibration::ScreenPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Paradigm {
    /// Optokinetic nystagmus: drifting stripes.
    Okn,
    /// Smooth pursuit of a moving target.
    Pursuit,
    /// Fixed sequence of target jumps.
    Saccades,
}

impl Paradigm {
    pub const ALL: [Paradigm; 3] = [Paradigm::Okn, Paradigm::Pursuit, Paradigm::Saccades];

    pub fn name(self) -> &'static str {
        match self {
            Paradigm::Okn => "okn",
            Paradigm::Pursuit => "pursuit",
            Paradigm::Saccades => "saccades",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|paradigm| paradigm.name() == name)
    }

    /// Length of the task, or `None` for paradigms that run until stopped.
    pub fn task_length(self) -> Option<Duration> {
        match self {
            Paradigm::Okn | Paradigm::Pursuit => None,
            Paradigm::Saccades => Some(SACCADE_TARGET_DWELL * SACCADE_TARGETS),
        }
    }
}

impl fmt::Display for Paradigm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const SACCADE_TARGETS: u32 = 20;
const SACCADE_TARGET_DWELL: Duration = Duration::from_secs(1);

/// What the driver is asked to put on screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StimulusDescriptor {
    Paradigm(Paradigm),
    CalibrationTarget { index: usize, point: ScreenPoint },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StimulusEvent {
    FrameRendered,
    TaskDone,
}

/// Contract for whatever draws stimuli.
pub trait StimulusDriver: Send {
    fn start(&mut self, descriptor: &StimulusDescriptor, now: Instant);
    fn stop(&mut self);
    /// Reports the render ticks (and at most one task completion) since the
    /// previous call.
    fn advance(&mut self, now: Instant) -> Vec<StimulusEvent>;
    fn is_active(&self) -> bool;
}

/// Driver with a timeline and no window. Emits one render tick per refresh
/// interval and finishes finite paradigms on time.
#[derive(Debug)]
pub struct HeadlessStimulus {
    frame_interval: Duration,
    active: Option<ActiveStimulus>,
}

#[derive(Debug)]
struct ActiveStimulus {
    descriptor: StimulusDescriptor,
    started_at: Instant,
    frames_rendered: u64,
}

impl HeadlessStimulus {
    pub fn new(frame_interval: Duration) -> Self {
        Self {
            frame_interval: frame_interval.max(Duration::from_micros(100)),
            active: None,
        }
    }

    pub fn current(&self) -> Option<&StimulusDescriptor> {
        self.active.as_ref().map(|active| &active.descriptor)
    }
}

impl StimulusDriver for HeadlessStimulus {
    fn start(&mut self, descriptor: &StimulusDescriptor, now: Instant) {
        tracing::debug!(?descriptor, "stimulus started");
        self.active = Some(ActiveStimulus {
            descriptor: descriptor.clone(),
            started_at: now,
            frames_rendered: 0,
        });
    }

    fn stop(&mut self) {
        if self.active.take().is_some() {
            tracing::debug!("stimulus stopped");
        }
    }

    fn advance(&mut self, now: Instant) -> Vec<StimulusEvent> {
        let Some(active) = self.active.as_mut() else {
            return Vec::new();
        };

        let elapsed = now.saturating_duration_since(active.started_at);
        let task_length = match active.descriptor {
            StimulusDescriptor::Paradigm(paradigm) => paradigm.task_length(),
            StimulusDescriptor::CalibrationTarget { .. } => None,
        };
        let horizon = task_length.map_or(elapsed, |length| elapsed.min(length));
        let due = (horizon.as_secs_f64() / self.frame_interval.as_secs_f64()).floor() as u64;

        let mut events = Vec::new();
        while active.frames_rendered < due {
            active.frames_rendered += 1;
            events.push(StimulusEvent::FrameRendered);
        }

        if task_length.is_some_and(|length| elapsed >= length) {
            events.push(StimulusEvent::TaskDone);
            self.active = None;
        }

        events
    }

    fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

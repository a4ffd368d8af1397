//! Ordered, single-threaded publish/subscribe inside the engine.
//!
//! Every event type and every subscriber is declared here; routes are fixed
//! when the bus is built and never change while it runs. Events are
//! delivered strictly in publish order, including events published while an
//! earlier one is being handled.

use std::collections::{HashMap, VecDeque};

use crate::{
    analysis::DerivedMetric,
    calibration::CalibrationBounds,
    device::CaptureFrame,
    error::{DeviceError, TransportError},
    record::DiscardReason,
    session::SessionId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FrameReady,
    StimulusTick,
    TaskDone,
    DeviceFault,
    CaptureStored,
    CaptureDiscarded,
    AnalysisFailed,
    CalibrationFinished,
    RecordPurged,
    ExportExpired,
    RetentionFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A completed device frame. Routed to the components that may take
    /// ownership of it; nothing else ever sees raw frames.
    FrameReady(CaptureFrame),
    StimulusTick,
    TaskDone,
    DeviceFault(DeviceError),
    CaptureStored {
        session: SessionId,
        frames: usize,
        derived: Option<DerivedMetric>,
    },
    CaptureDiscarded {
        session: SessionId,
        frames: usize,
        reason: DiscardReason,
    },
    AnalysisFailed {
        session: SessionId,
        reason: String,
    },
    CalibrationFinished(Result<CalibrationBounds, String>),
    RecordPurged {
        session: SessionId,
    },
    ExportExpired {
        session: SessionId,
        last_error: Option<TransportError>,
    },
    RetentionFailed {
        detail: String,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::FrameReady(_) => EventKind::FrameReady,
            Event::StimulusTick => EventKind::StimulusTick,
            Event::TaskDone => EventKind::TaskDone,
            Event::DeviceFault(_) => EventKind::DeviceFault,
            Event::CaptureStored { .. } => EventKind::CaptureStored,
            Event::CaptureDiscarded { .. } => EventKind::CaptureDiscarded,
            Event::AnalysisFailed { .. } => EventKind::AnalysisFailed,
            Event::CalibrationFinished(_) => EventKind::CalibrationFinished,
            Event::RecordPurged { .. } => EventKind::RecordPurged,
            Event::ExportExpired { .. } => EventKind::ExportExpired,
            Event::RetentionFailed { .. } => EventKind::RetentionFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subscriber {
    /// The state machine itself.
    Engine,
    Recorder,
    Calibrator,
    ExportBridge,
    /// Pushes notices out to the connected control surface.
    ControlSurface,
}

/// The engine's wiring.
pub const ENGINE_ROUTES: &[(EventKind, Subscriber)] = &[
    (EventKind::FrameReady, Subscriber::Recorder),
    (EventKind::FrameReady, Subscriber::Calibrator),
    (EventKind::StimulusTick, Subscriber::Calibrator),
    (EventKind::TaskDone, Subscriber::Engine),
    (EventKind::TaskDone, Subscriber::ControlSurface),
    (EventKind::DeviceFault, Subscriber::Engine),
    (EventKind::DeviceFault, Subscriber::ControlSurface),
    (EventKind::CaptureStored, Subscriber::ExportBridge),
    (EventKind::CaptureStored, Subscriber::ControlSurface),
    (EventKind::CaptureDiscarded, Subscriber::ControlSurface),
    (EventKind::AnalysisFailed, Subscriber::ControlSurface),
    (EventKind::CalibrationFinished, Subscriber::Engine),
    (EventKind::CalibrationFinished, Subscriber::ControlSurface),
    (EventKind::RecordPurged, Subscriber::ExportBridge),
    (EventKind::RecordPurged, Subscriber::ControlSurface),
    (EventKind::ExportExpired, Subscriber::ControlSurface),
    (EventKind::RetentionFailed, Subscriber::ControlSurface),
];

/// One event and the subscribers it goes to, in registration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub event: Event,
    pub subscribers: Vec<Subscriber>,
}

#[derive(Debug, Default)]
pub struct EventBus {
    routes: HashMap<EventKind, Vec<Subscriber>>,
    queue: VecDeque<Event>,
}

impl EventBus {
    pub fn new(routes: &[(EventKind, Subscriber)]) -> Self {
        let mut table: HashMap<EventKind, Vec<Subscriber>> = HashMap::new();
        for (kind, subscriber) in routes {
            let subscribers = table.entry(*kind).or_default();
            if !subscribers.contains(subscriber) {
                subscribers.push(*subscriber);
            }
        }
        Self {
            routes: table,
            queue: VecDeque::new(),
        }
    }

    pub fn subscribers(&self, kind: EventKind) -> &[Subscriber] {
        self.routes.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Queues an event. Events nobody subscribes to are dropped here.
    pub fn publish(&mut self, event: Event) {
        if self.subscribers(event.kind()).is_empty() {
            tracing::trace!(kind = ?event.kind(), "event has no subscribers");
            return;
        }
        self.queue.push_back(event);
    }

    pub fn next(&mut self) -> Option<Delivery> {
        let event = self.queue.pop_front()?;
        let subscribers = self.subscribers(event.kind()).to_vec();
        Some(Delivery { event, subscribers })
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

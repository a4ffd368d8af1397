use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use tokio::sync::mpsc;

use crate::error::DeviceError;

use super::{CaptureFrame, CaptureHandle, DeviceAdapter};

const IDLE_SLEEP: Duration = Duration::from_millis(5);

/// What the worker thread posts to the engine loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    Frame(CaptureFrame),
    /// `stream` is the epoch that was current when the fault happened.
    Fault { error: DeviceError, stream: u64 },
}

#[derive(Debug, Default)]
struct WorkerFlags {
    streaming: AtomicBool,
    /// Bumped each time streaming is switched on.
    stream: AtomicU64,
    shutdown: AtomicBool,
}

/// Switch the engine flips to start and stop frame delivery.
#[derive(Debug, Clone, Default)]
pub struct DeviceControl {
    flags: Arc<WorkerFlags>,
}

impl DeviceControl {
    /// A control with no worker behind it, for engines driven directly by
    /// tests or replays.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn set_streaming(&self, streaming: bool) {
        if streaming && !self.is_streaming() {
            self.flags.stream.fetch_add(1, Ordering::AcqRel);
        }
        self.flags.streaming.store(streaming, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.flags.streaming.load(Ordering::Acquire)
    }

    /// Epoch of the current (or most recent) streaming period.
    pub fn stream(&self) -> u64 {
        self.flags.stream.load(Ordering::Acquire)
    }
}

/// Owns the device adapter on a dedicated thread so that blocking hardware
/// reads never stall the engine loop. Completed frames go out through a
/// non-blocking unbounded channel.
#[derive(Debug)]
pub struct DeviceWorker {
    control: DeviceControl,
    thread: Option<JoinHandle<()>>,
}

impl DeviceWorker {
    pub fn spawn(
        adapter: Box<dyn DeviceAdapter>,
        events: mpsc::UnboundedSender<DeviceMessage>,
    ) -> std::io::Result<Self> {
        let control = DeviceControl::default();
        let flags = control.flags.clone();
        let thread = std::thread::Builder::new()
            .name("gazeguard-device".to_string())
            .spawn(move || run_worker(adapter, flags, events))?;

        Ok(Self {
            control,
            thread: Some(thread),
        })
    }

    pub fn control(&self) -> DeviceControl {
        self.control.clone()
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.control.flags.shutdown.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("device worker panicked");
            }
        }
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut adapter: Box<dyn DeviceAdapter>,
    flags: Arc<WorkerFlags>,
    events: mpsc::UnboundedSender<DeviceMessage>,
) {
    let mut handle: Option<Box<dyn CaptureHandle>> = None;
    let mut last_timestamp = f64::NEG_INFINITY;
    // Epoch in which the device last faulted. Nothing is opened again until
    // the engine starts a new streaming period.
    let mut halted: Option<u64> = None;

    while !flags.shutdown.load(Ordering::Acquire) {
        let stream = flags.stream.load(Ordering::Acquire);
        if !flags.streaming.load(Ordering::Acquire) || halted == Some(stream) {
            std::thread::sleep(IDLE_SLEEP);
            continue;
        }
        halted = None;

        if handle.is_none() {
            match adapter.open() {
                Ok(opened) => {
                    tracing::info!(device = adapter.name(), "device opened");
                    last_timestamp = f64::NEG_INFINITY;
                    handle = Some(opened);
                }
                Err(err) => {
                    tracing::warn!(device = adapter.name(), error = %err, "device open failed");
                    halted = Some(stream);
                    if events.send(DeviceMessage::Fault { error: err, stream }).is_err() {
                        break;
                    }
                    continue;
                }
            }
        }
        let Some(active) = handle.as_mut() else {
            continue;
        };

        match active.poll_frame() {
            Ok(frame) => {
                if frame.timestamp < last_timestamp {
                    tracing::debug!("dropping frame with a timestamp earlier than its predecessor");
                    continue;
                }
                last_timestamp = frame.timestamp;
                if events.send(DeviceMessage::Frame(frame)).is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(device = adapter.name(), error = %err, "device read failed");
                active.close();
                handle = None;
                halted = Some(stream);
                if events.send(DeviceMessage::Fault { error: err, stream }).is_err() {
                    break;
                }
            }
        }
    }

    if let Some(mut active) = handle {
        active.close();
    }
    tracing::debug!("device worker stopped");
}

//! Single-threaded event loop around the [`Engine`].
//!
//! One event is handled at a time. The loop never blocks on I/O; device
//! reads happen on the worker thread and arrive here as messages.

use std::time::{Duration, Instant};

use tokio::{
    sync::{broadcast, mpsc},
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    channel::Envelope,
    device::DeviceMessage,
    error::TransportError,
    export::{ExportMessage, ExportResponse},
};

use super::Engine;

/// Event sources feeding the loop.
#[derive(Debug)]
pub struct EngineIo {
    pub commands: mpsc::Receiver<Envelope>,
    pub device: mpsc::UnboundedReceiver<DeviceMessage>,
    pub exports: mpsc::Receiver<ExportMessage>,
    /// Rendered notices for the control surface.
    pub notices: broadcast::Sender<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
pub struct Timers {
    pub stimulus: Duration,
    pub reaper: Duration,
}

/// Runs until cancelled or until an `exit` command. Returns the engine so the
/// caller decides when the store is dropped.
pub async fn run(mut engine: Engine, mut io: EngineIo, timers: Timers) -> Engine {
    let mut stimulus = time::interval(timers.stimulus);
    stimulus.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut reaper = time::interval(timers.reaper);
    reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(store = ?engine.store().path(), "engine loop started");
    loop {
        let deadline = engine.next_deadline();
        let expiry = engine.next_expiry();
        tokio::select! {
            biased;
            _ = io.cancel.cancelled() => break,
            _ = wait_until(expiry) => engine.reap(now()),
            Some(envelope) = io.commands.recv() => {
                // Frames already queued were captured before this command.
                drain_device(&mut engine, &mut io.device);
                let ack = engine.handle(envelope.seq, envelope.command, now());
                if envelope.reply.send(ack).is_err() {
                    tracing::debug!("requester left before its acknowledgement");
                }
            }
            Some(message) = io.device.recv() => engine.on_device(message, now()),
            _ = wait_until(deadline) => {
                drain_device(&mut engine, &mut io.device);
                engine.on_deadline(now());
            }
            Some(message) = io.exports.recv() => export(&mut engine, message),
            // Retries failed evictions and deferred writes.
            _ = reaper.tick() => engine.reap(now()),
            _ = stimulus.tick() => engine.on_tick(now()),
        }

        for notice in engine.drain_notices() {
            // No subscriber simply means no control surface is connected.
            let _ = io.notices.send(notice.to_string());
        }
        if engine.is_shutting_down() {
            io.cancel.cancel();
            break;
        }
    }

    tracing::info!("engine loop stopped");
    engine
}

fn drain_device(engine: &mut Engine, device: &mut mpsc::UnboundedReceiver<DeviceMessage>) {
    while let Ok(message) = device.try_recv() {
        engine.on_device(message, now());
    }
}

fn export(engine: &mut Engine, message: ExportMessage) {
    match message {
        ExportMessage::Call(call) => {
            let response = engine.on_export(&call.peer, &call.request, now());
            if let Err(ExportResponse::Batch(batch)) = call.reply.send(response) {
                engine.on_export_failure(
                    batch.session,
                    TransportError::Delivery("poller went away".into()),
                    now(),
                );
            }
        }
        ExportMessage::DeliveryFailed { session, error } => {
            engine.on_export_failure(session, error, now())
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

/// Wall clock as seen by tokio, so paused test time applies to the engine.
fn now() -> Instant {
    time::Instant::now().into_std()
}

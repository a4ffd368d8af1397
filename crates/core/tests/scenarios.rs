use std::time::{Duration, Instant};

use gazeguard_core::{
    config::StoreConfig,
    device::{DeviceControl, DeviceMessage, SyntheticDevice},
    error::DeviceError,
    engine::runtime::{self, EngineIo, Timers},
    CommandChannel, Engine, EngineConfig, EngineState, ErrorKind, ExportRequest, ExportResponse,
    Paradigm, PeerCertificate, SessionId, SessionRegistry,
};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

const AUTHORITY: &str = "AA:BB:CC:DD";
const SCRIPTED_ID: u64 = 0x1A2B_3C4D_5E6F_7890;

struct Bench {
    engine: Engine,
    control: DeviceControl,
    seq: u64,
    start: Instant,
    _base: tempfile::TempDir,
}

impl Bench {
    fn new() -> Self {
        let base = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            store: StoreConfig {
                base_dir: Some(base.path().to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        };
        config.export.trusted_authority = Some(AUTHORITY.to_string());

        let sessions = SessionRegistry::new(
            Box::new(std::iter::once(SCRIPTED_ID)),
            config.store.ttl(),
        );
        let control = DeviceControl::detached();
        let engine = Engine::new(&config, control.clone())
            .unwrap()
            .with_sessions(sessions);
        Self {
            engine,
            control,
            seq: 0,
            start: Instant::now(),
            _base: base,
        }
    }

    fn at(&self, secs: u64) -> Instant {
        self.start + Duration::from_secs(secs)
    }

    fn send(&mut self, line: &str, secs: u64) -> String {
        self.seq += 1;
        let command = gazeguard_core::protocol::parse(line).unwrap();
        let now = self.at(secs);
        self.engine.handle(self.seq, command, now).to_string()
    }

    fn feed(&mut self, frames: std::ops::Range<u64>, secs: u64) {
        let now = self.at(secs);
        for index in frames {
            self.engine
                .on_device(DeviceMessage::Frame(SyntheticDevice::sample(120.0, index)), now);
        }
    }

    fn sealed(&mut self) -> Option<String> {
        self.notices()
            .into_iter()
            .find(|notice| notice.starts_with("* sealed"))
    }

    fn notices(&mut self) -> Vec<String> {
        self.engine
            .drain_notices()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Shows OKN and records 30 seconds of synthetic gaze, sealing at the
    /// deadline.
    fn capture(&mut self) {
        assert_eq!(self.send("show okn", 0), "1 ok");
        assert_eq!(self.send("record 30s", 0), "2 ok");
        self.feed(0..3600, 15);
        self.engine.on_deadline(self.at(30));
    }
}

fn trusted_peer() -> PeerCertificate {
    PeerCertificate {
        subject: "ingest.internal".to_string(),
        issuer_fingerprint: "aabbccdd".to_string(),
    }
}

#[test]
fn full_capture_lands_in_the_store_with_its_ttl() {
    let mut bench = Bench::new();
    bench.capture();

    let session = SessionId(SCRIPTED_ID);
    assert_eq!(bench.engine.state(), EngineState::Idle);
    assert_eq!(bench.engine.session(), None);
    assert_eq!(bench.engine.store().live(bench.at(30)), 1);
    assert_eq!(
        bench.engine.store().deadline(session),
        Some(bench.at(30) + Duration::from_secs(300))
    );

    let notices = bench.notices();
    assert_eq!(notices.len(), 1, "{notices:?}");
    assert!(
        notices[0].starts_with("* sealed session=1a2b3c4d5e6f7890 frames=3600"),
        "{}",
        notices[0]
    );
    assert_eq!(bench.engine.bridge().pending(), 1);
}

#[test]
fn second_record_is_refused_while_recording() {
    let mut bench = Bench::new();
    bench.send("show okn", 0);
    bench.send("record 30s", 0);

    let reply = bench.send("record 5s", 1);
    assert_eq!(reply, "3 error StateError \"already recording\"");
    assert_eq!(bench.engine.state(), EngineState::Recording(Paradigm::Okn));
}

#[test]
fn device_fault_discards_the_capture() {
    let mut bench = Bench::new();
    bench.send("show okn", 0);
    bench.send("record 30s", 0);
    bench.feed(0..1200, 10);

    let fault = DeviceMessage::Fault {
        error: DeviceError::Disconnected,
        stream: bench.control.stream(),
    };
    bench.engine.on_device(fault, bench.at(10));

    assert_eq!(bench.engine.state(), EngineState::Idle);
    assert_eq!(bench.engine.buffered_frames(), 0);
    assert_eq!(bench.engine.store().live(bench.at(10)), 0);

    let notices = bench.notices();
    assert_eq!(notices[0], "* error DeviceError \"device disconnected\"");
    assert_eq!(
        notices[1],
        "* discarded session=1a2b3c4d5e6f7890 frames=1200 reason=device-fault"
    );
}

#[test]
fn purged_records_are_never_exported() {
    let mut bench = Bench::new();
    bench.capture();
    bench.notices();

    bench.engine.reap(bench.at(30 + 301));
    let notices = bench.notices();
    assert!(notices.contains(&"* purged session=1a2b3c4d5e6f7890".to_string()));
    assert!(notices
        .iter()
        .any(|notice| notice.starts_with("* error TransportError")));

    let response = bench
        .engine
        .on_export(&trusted_peer(), &ExportRequest::Poll, bench.at(30 + 301));
    assert_eq!(response, ExportResponse::NoData);
}

#[test]
fn exported_batch_carries_only_derived_fields() {
    let mut bench = Bench::new();
    bench.capture();

    let response = bench
        .engine
        .on_export(&trusted_peer(), &ExportRequest::Poll, bench.at(31));
    let ExportResponse::Batch(batch) = &response else {
        panic!("expected a batch, got {response:?}");
    };
    assert_eq!(batch.session, SessionId(SCRIPTED_ID));

    let value = serde_json::to_value(&response).unwrap();
    let mut keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
    keys.sort();
    assert_eq!(keys, ["derived", "session", "type"]);
    let mut derived: Vec<_> = value["derived"].as_object().unwrap().keys().cloned().collect();
    derived.sort();
    assert_eq!(derived, ["amplitude_deg", "calibrated", "frequency_hz"]);

    let ack = ExportRequest::Ack {
        session: batch.session,
    };
    assert_eq!(
        bench.engine.on_export(&trusted_peer(), &ack, bench.at(32)),
        ExportResponse::Acked
    );
    assert_eq!(bench.engine.bridge().pending(), 0);
}

#[test]
fn untrusted_poller_gets_nothing() {
    let mut bench = Bench::new();
    bench.capture();

    let stranger = PeerCertificate {
        subject: "laptop".to_string(),
        issuer_fingerprint: "00:11".to_string(),
    };
    let response = bench
        .engine
        .on_export(&stranger, &ExportRequest::Poll, bench.at(31));
    assert!(matches!(response, ExportResponse::Rejected { .. }));
    assert_eq!(bench.engine.bridge().pending(), 1);
}

#[test]
fn repeated_stop_changes_nothing() {
    let mut bench = Bench::new();
    bench.send("show okn", 0);
    bench.send("record 30s", 0);
    bench.feed(0..480, 4);

    assert_eq!(bench.send("stop", 4), "3 ok");
    let sealed = bench.sealed().unwrap();
    assert!(sealed.contains("frames=480"), "{sealed}");

    for secs in 5..8 {
        let reply = bench.send("stop", secs);
        assert!(reply.ends_with(" ok"), "{reply}");
        assert_eq!(bench.engine.state(), EngineState::Idle);
        assert!(bench.notices().is_empty());
    }
    assert_eq!(bench.engine.store().live(bench.at(8)), 1);
}

#[test]
fn frame_count_matches_frames_delivered_while_recording() {
    let mut bench = Bench::new();
    bench.send("show okn", 0);
    bench.feed(0..100, 0);
    bench.send("record 30s", 1);
    for second in 1..6 {
        let first = second * 120;
        bench.feed(first..first + 120, second);
        assert_eq!(bench.engine.buffered_frames() as u64, second * 120);
    }
    bench.send("stop", 6);
    bench.feed(720..800, 7);

    let sealed = bench.sealed().unwrap();
    assert!(sealed.contains("frames=600"), "{sealed}");
}

#[tokio::test(start_paused = true)]
async fn malformed_line_never_reaches_the_engine() {
    let base = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        store: StoreConfig {
            base_dir: Some(base.path().to_path_buf()),
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Engine::new(&config, DeviceControl::detached()).unwrap();

    let (mut channel, commands) = CommandChannel::bounded(4);
    let (_device_tx, device) = mpsc::unbounded_channel();
    let (_exports_tx, exports) = mpsc::channel(4);
    let (notices, _) = broadcast::channel(16);
    let cancel = CancellationToken::new();
    let io = EngineIo {
        commands,
        device,
        exports,
        notices,
        cancel: cancel.clone(),
    };
    let timers = Timers {
        stimulus: config.stimulus.frame_interval(),
        reaper: config.store.reap_interval(),
    };
    let handle = tokio::spawn(runtime::run(engine, io, timers));

    let ack = channel.submit("recrod 30s").await;
    assert_eq!(ack.seq, 1);
    assert_eq!(ack.error_kind(), Some(ErrorKind::ProtocolError));
    assert_eq!(channel.next_seq(), 2);

    let status = channel.submit("status").await;
    assert_eq!(status.seq, 2);
    assert!(status.payload().unwrap().starts_with("state=idle session=none"));

    cancel.cancel();
    let engine = handle.await.unwrap();
    assert_eq!(engine.state(), EngineState::Idle);
}

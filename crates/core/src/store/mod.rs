//! Time-bounded storage for raw captures.
//!
//! Raw frames are written into a per-process directory that only the owner
//! can read and that disappears with the engine. The store hands out derived
//! metrics, never frames. A record whose age reaches its TTL is gone: lookups
//! stop returning it immediately and the next sweep deletes its file.

use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use serde::Serialize;
use tempfile::TempDir;

use crate::{
    analysis::DerivedMetric, config::StoreConfig, device::CaptureFrame, error::RetentionError,
    record::SealedBuffer, session::SessionId,
};

#[derive(Debug)]
struct EphemeralRecord {
    created: Instant,
    ttl: Duration,
    derived: Option<DerivedMetric>,
    path: PathBuf,
    /// Capture whose write failed; retried by the reaper until expiry.
    unwritten: Option<SealedBuffer>,
}

impl EphemeralRecord {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created) >= self.ttl
    }
}

#[derive(Serialize)]
struct RecordFile<'a> {
    session: SessionId,
    ttl_secs: u64,
    frames: &'a [CaptureFrame],
}

/// Outcome of one reaper sweep.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub purged: Vec<SessionId>,
    pub failures: Vec<RetentionError>,
}

#[derive(Debug)]
pub struct EphemeralStore {
    dir: TempDir,
    ttl: Duration,
    records: BTreeMap<SessionId, EphemeralRecord>,
    pending_evictions: Vec<PathBuf>,
}

impl EphemeralStore {
    pub fn open(config: &StoreConfig) -> Result<Self, RetentionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("gazeguard-");
        let dir = match &config.base_dir {
            Some(base) => {
                std::fs::create_dir_all(base).map_err(RetentionError::CreateDir)?;
                builder.tempdir_in(base)
            }
            None => builder.tempdir(),
        }
        .map_err(RetentionError::CreateDir)?;

        tracing::info!(path = ?dir.path(), ttl_secs = config.ttl_secs, "ephemeral store opened");
        Ok(Self {
            dir,
            ttl: config.ttl(),
            records: BTreeMap::new(),
            pending_evictions: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Stores a sealed capture with its derived metric. The record is indexed
    /// even if the write fails; the failure is returned for reporting and the
    /// write is retried on every sweep.
    pub fn insert(
        &mut self,
        capture: SealedBuffer,
        derived: Option<DerivedMetric>,
        now: Instant,
    ) -> Result<(), RetentionError> {
        let session = capture.session();
        if let Some(previous) = self.records.remove(&session) {
            self.evict(previous.path);
        }

        let path = self.dir.path().join(format!("{session}.json"));
        let written = write_record(&path, &capture, self.ttl);

        let unwritten = match &written {
            Ok(()) => None,
            Err(err) => {
                tracing::warn!(%session, error = %err, "raw capture kept in memory until the write succeeds");
                Some(capture)
            }
        };

        self.records.insert(
            session,
            EphemeralRecord {
                created: now,
                ttl: self.ttl,
                derived,
                path,
                unwritten,
            },
        );
        tracing::debug!(%session, "record stored");
        written
    }

    pub fn contains(&self, session: SessionId, now: Instant) -> bool {
        self.records
            .get(&session)
            .is_some_and(|record| !record.expired(now))
    }

    /// Read-only view of a live record's derived metric.
    pub fn derived(&self, session: SessionId, now: Instant) -> Option<DerivedMetric> {
        self.records
            .get(&session)
            .filter(|record| !record.expired(now))
            .and_then(|record| record.derived)
    }

    /// Instant at which the session's record expires.
    pub fn deadline(&self, session: SessionId) -> Option<Instant> {
        self.records
            .get(&session)
            .map(|record| record.created + record.ttl)
    }

    /// Earliest expiry among indexed records. Purged records leave the index,
    /// so a reap at this instant always moves it forward.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.records
            .values()
            .map(|record| record.created + record.ttl)
            .min()
    }

    pub fn live(&self, now: Instant) -> usize {
        self.records
            .values()
            .filter(|record| !record.expired(now))
            .count()
    }

    /// Purges every record whose TTL has elapsed and retries earlier
    /// failures. Never skips a record because another one failed.
    pub fn reap(&mut self, now: Instant) -> ReapReport {
        let mut report = ReapReport::default();

        let expired: Vec<SessionId> = self
            .records
            .iter()
            .filter(|(_, record)| record.expired(now))
            .map(|(session, _)| *session)
            .collect();

        for session in expired {
            if let Some(record) = self.records.remove(&session) {
                // A failed write may still have left a partial file behind.
                self.pending_evictions.push(record.path);
                tracing::info!(%session, "record purged");
                report.purged.push(session);
            }
        }

        let pending = std::mem::take(&mut self.pending_evictions);
        for path in pending {
            if let Err(err) = remove_file(&path) {
                tracing::warn!(error = %err, "eviction failed, retrying next sweep");
                self.pending_evictions.push(path);
                report.failures.push(err);
            }
        }

        let ttl = self.ttl;
        for (session, record) in self.records.iter_mut() {
            let Some(capture) = record.unwritten.as_ref() else {
                continue;
            };
            match write_record(&record.path, capture, ttl) {
                Ok(()) => {
                    tracing::info!(%session, "deferred record write succeeded");
                    record.unwritten = None;
                }
                Err(err) => report.failures.push(err),
            }
        }

        report
    }

    fn evict(&mut self, path: PathBuf) {
        if let Err(err) = remove_file(&path) {
            tracing::warn!(error = %err, "eviction failed, retrying next sweep");
            self.pending_evictions.push(path);
        }
    }
}

fn write_record(path: &Path, capture: &SealedBuffer, ttl: Duration) -> Result<(), RetentionError> {
    let body = serde_json::to_vec(&RecordFile {
        session: capture.session(),
        ttl_secs: ttl.as_secs(),
        frames: capture.frames(),
    })?;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let to_error = |source| RetentionError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = options.open(path).map_err(to_error)?;
    file.write_all(&body).map_err(to_error)?;
    file.sync_all().map_err(to_error)
}

fn remove_file(path: &Path) -> Result<(), RetentionError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(RetentionError::Evict {
            path: path.to_path_buf(),
            source,
        }),
    }
}

//! Pull-based hand-off of derived metrics to trusted infrastructure.
//!
//! The bridge sits behind an external mutual-TLS terminator which hands over
//! the peer's certificate details with every request. Only peers issued by
//! the configured authority are served. A batch carries a session id and its
//! derived metric; there is no field that could carry frames.

mod listener;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::{
    analysis::DerivedMetric, config::ExportConfig, error::TransportError, session::SessionId,
    store::EphemeralStore,
};

pub use listener::{serve, ExportCall, ExportMessage, TerminatedRequest};

/// Fingerprint of the one certificate authority the bridge trusts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedAuthority {
    fingerprint: String,
}

impl TrustedAuthority {
    pub fn new(fingerprint: impl Into<String>) -> Self {
        Self {
            fingerprint: normalise(&fingerprint.into()),
        }
    }

    pub fn verify(&self, peer: &PeerCertificate) -> Result<(), TransportError> {
        if normalise(&peer.issuer_fingerprint) == self.fingerprint {
            Ok(())
        } else {
            Err(TransportError::UntrustedPeer {
                subject: peer.subject.clone(),
            })
        }
    }
}

fn normalise(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Identity of the remote end as established by the TLS layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCertificate {
    pub subject: String,
    pub issuer_fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportRequest {
    Poll,
    /// Confirms receipt of a leased batch.
    Ack { session: SessionId },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExportBatch {
    pub session: SessionId,
    pub derived: DerivedMetric,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportResponse {
    Batch(ExportBatch),
    NoData,
    Acked,
    Rejected { reason: String },
}

/// Exponential backoff without jitter: `min(base * 2^failures, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms.max(config.backoff_base_ms)),
        }
    }

    /// Delay after the given number of earlier failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

#[derive(Debug)]
struct Lease {
    holder: String,
    expires: Instant,
}

#[derive(Debug)]
struct PendingBatch {
    session: SessionId,
    deadline: Instant,
    failures: u32,
    lease: Option<Lease>,
    withheld_until: Option<Instant>,
    last_error: Option<TransportError>,
}

impl PendingBatch {
    fn available(&self, now: Instant) -> bool {
        self.lease.is_none() && self.withheld_until.map_or(true, |until| now >= until)
    }

    fn fail(&mut self, err: TransportError, backoff: &Backoff, now: Instant) {
        let delay = backoff.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        self.lease = None;
        self.withheld_until = Some(now + delay);
        tracing::warn!(
            session = %self.session,
            failures = self.failures,
            retry_in_ms = delay.as_millis() as u64,
            error = %err,
            "export delivery failed"
        );
        self.last_error = Some(err);
    }
}

/// A batch dropped because its record's TTL ran out first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpiredExport {
    pub session: SessionId,
    pub last_error: Option<TransportError>,
}

/// Queue of sessions whose derived metric is waiting to be pulled.
#[derive(Debug)]
pub struct ExportBridge {
    authority: Option<TrustedAuthority>,
    lease: Duration,
    backoff: Backoff,
    pending: Vec<PendingBatch>,
    /// Requests turned away at authentication. They never touch a batch.
    rejected: u64,
}

impl ExportBridge {
    pub fn new(config: &ExportConfig) -> Self {
        Self {
            authority: config.trusted_authority.as_deref().map(TrustedAuthority::new),
            lease: config.lease(),
            backoff: Backoff::from_config(config),
            pending: Vec::new(),
            rejected: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn rejected_requests(&self) -> u64 {
        self.rejected
    }

    /// Queues a session whose record holds a derived metric. The batch can
    /// never be offered past `deadline`.
    pub fn enqueue(&mut self, session: SessionId, deadline: Instant) {
        self.pending.retain(|batch| batch.session != session);
        self.pending.push(PendingBatch {
            session,
            deadline,
            failures: 0,
            lease: None,
            withheld_until: None,
            last_error: None,
        });
        tracing::debug!(%session, "export batch queued");
    }

    /// Serves one authenticated request. The metric itself is read from the
    /// store at poll time, so an expired record can never be exported.
    pub fn handle(
        &mut self,
        peer: &PeerCertificate,
        request: &ExportRequest,
        store: &EphemeralStore,
        now: Instant,
    ) -> ExportResponse {
        if let Err(err) = self.authenticate(peer) {
            self.rejected += 1;
            tracing::warn!(
                subject = %peer.subject,
                error = %err,
                rejected = self.rejected,
                "export request rejected"
            );
            return ExportResponse::Rejected {
                reason: err.to_string(),
            };
        }

        self.expire_leases(now);
        match request {
            ExportRequest::Poll => self.poll(peer, store, now),
            ExportRequest::Ack { session } => self.ack(peer, *session),
        }
    }

    /// Reports that a leased batch did not reach the poller.
    pub fn delivery_failed(&mut self, session: SessionId, err: TransportError, now: Instant) {
        let backoff = self.backoff;
        if let Some(batch) = self
            .pending
            .iter_mut()
            .find(|batch| batch.session == session && batch.lease.is_some())
        {
            batch.fail(err, &backoff, now);
        }
    }

    /// Drops the batch of a purged record.
    pub fn discard(&mut self, session: SessionId) -> Option<ExpiredExport> {
        let index = self.pending.iter().position(|batch| batch.session == session)?;
        let batch = self.pending.remove(index);
        tracing::info!(%session, failures = batch.failures, "export batch expired before pickup");
        Some(ExpiredExport {
            session,
            last_error: batch.last_error,
        })
    }

    /// Drops every batch whose deadline has passed and turns lapsed leases
    /// into failures.
    pub fn sweep(&mut self, now: Instant) -> Vec<ExpiredExport> {
        self.expire_leases(now);
        let expired: Vec<SessionId> = self
            .pending
            .iter()
            .filter(|batch| now >= batch.deadline)
            .map(|batch| batch.session)
            .collect();
        expired
            .into_iter()
            .filter_map(|session| self.discard(session))
            .collect()
    }

    fn authenticate(&self, peer: &PeerCertificate) -> Result<(), TransportError> {
        match &self.authority {
            Some(authority) => authority.verify(peer),
            None => Err(TransportError::NotConfigured),
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let backoff = self.backoff;
        for batch in &mut self.pending {
            let lapsed = batch.lease.as_ref().is_some_and(|lease| now >= lease.expires);
            if lapsed {
                batch.fail(
                    TransportError::Delivery("lease expired without acknowledgement".into()),
                    &backoff,
                    now,
                );
            }
        }
    }

    fn poll(&mut self, peer: &PeerCertificate, store: &EphemeralStore, now: Instant) -> ExportResponse {
        let lease = self.lease;
        let mut stale = Vec::new();
        let mut offered = None;

        for batch in &mut self.pending {
            if now >= batch.deadline || !batch.available(now) {
                continue;
            }
            let Some(derived) = store.derived(batch.session, now) else {
                stale.push(batch.session);
                continue;
            };
            batch.lease = Some(Lease {
                holder: peer.subject.clone(),
                expires: (now + lease).min(batch.deadline),
            });
            offered = Some(ExportBatch {
                session: batch.session,
                derived,
            });
            break;
        }

        self.pending.retain(|batch| !stale.contains(&batch.session));
        match offered {
            Some(batch) => {
                tracing::info!(session = %batch.session, peer = %peer.subject, "export batch leased");
                ExportResponse::Batch(batch)
            }
            None => ExportResponse::NoData,
        }
    }

    fn ack(&mut self, peer: &PeerCertificate, session: SessionId) -> ExportResponse {
        let leased_here = self.pending.iter().position(|batch| {
            batch.session == session
                && batch
                    .lease
                    .as_ref()
                    .is_some_and(|lease| lease.holder == peer.subject)
        });

        match leased_here {
            Some(index) => {
                self.pending.remove(index);
                tracing::info!(%session, peer = %peer.subject, "export batch delivered");
                ExportResponse::Acked
            }
            None => ExportResponse::Rejected {
                reason: format!("no outstanding lease for session {session}"),
            },
        }
    }
}

use std::{
    collections::HashMap,
    fmt,
    time::{Duration, Instant},
};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Random 64-bit identifier of one capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Parses the 16-digit hex form produced by `Display`, with or without a
    /// `0x` prefix.
    pub fn parse(text: &str) -> Option<Self> {
        let digits = text.strip_prefix("0x").unwrap_or(text);
        u64::from_str_radix(digits, 16).ok().map(SessionId)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Source of candidate identifiers. Entropy-seeded by default; tests hand in
/// scripted sequences.
pub type IdSource = Box<dyn Iterator<Item = u64> + Send>;

/// Endless stream of random identifiers.
pub struct RandomIds {
    rng: StdRng,
}

impl RandomIds {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for RandomIds {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.rng.gen())
    }
}

/// Issues session identifiers and remembers them for the retention window so
/// that none is handed out twice while a record could still carry it.
pub struct SessionRegistry {
    source: IdSource,
    fallback: RandomIds,
    window: Duration,
    issued: HashMap<SessionId, Instant>,
}

impl SessionRegistry {
    pub fn new(source: IdSource, window: Duration) -> Self {
        Self {
            source,
            fallback: RandomIds::new(),
            window,
            issued: HashMap::new(),
        }
    }

    pub fn random(window: Duration) -> Self {
        Self::new(Box::new(RandomIds::new()), window)
    }

    pub fn issue(&mut self, now: Instant) -> SessionId {
        let window = self.window;
        self.issued
            .retain(|_, issued_at| now.saturating_duration_since(*issued_at) < window);

        loop {
            let candidate = self
                .source
                .next()
                .or_else(|| self.fallback.next())
                .map(SessionId)
                .unwrap_or(SessionId(0));

            if candidate.0 == 0 || self.issued.contains_key(&candidate) {
                tracing::debug!(session = %candidate, "rejecting reused session id");
                continue;
            }

            self.issued.insert(candidate, now);
            return candidate;
        }
    }

    /// Restarts the window for an id whose record was written at `now`.
    pub fn refresh(&mut self, session: SessionId, now: Instant) {
        if let Some(seen) = self.issued.get_mut(&session) {
            *seen = now;
        }
    }

    pub fn remembered(&self) -> usize {
        self.issued.len()
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("window", &self.window)
            .field("issued", &self.issued.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trips_through_parse() {
        let id = SessionId(0x1A2B_3C4D_5E6F_7890);
        assert_eq!(id.to_string(), "1a2b3c4d5e6f7890");
        assert_eq!(SessionId::parse("0x1A2B3C4D5E6F7890"), Some(id));
        assert_eq!(SessionId::parse("zz"), None);
    }

    #[test]
    fn never_reissues_within_window() {
        let source = vec![7, 7, 0, 9].into_iter();
        let mut registry = SessionRegistry::new(Box::new(source), Duration::from_secs(300));
        let now = Instant::now();

        assert_eq!(registry.issue(now), SessionId(7));
        assert_eq!(registry.issue(now + Duration::from_secs(1)), SessionId(9));
    }

    #[test]
    fn forgets_ids_after_window() {
        let source = vec![7, 7].into_iter();
        let mut registry = SessionRegistry::new(Box::new(source), Duration::from_secs(300));
        let now = Instant::now();

        registry.issue(now);
        assert_eq!(
            registry.issue(now + Duration::from_secs(301)),
            SessionId(7)
        );
        assert_eq!(registry.remembered(), 1);
    }

    #[test]
    fn refresh_extends_memory_to_the_record() {
        let source = vec![7, 7, 8].into_iter();
        let mut registry = SessionRegistry::new(Box::new(source), Duration::from_secs(300));
        let now = Instant::now();

        registry.issue(now);
        registry.refresh(SessionId(7), now + Duration::from_secs(60));
        assert_eq!(
            registry.issue(now + Duration::from_secs(301)),
            SessionId(8)
        );
    }
}

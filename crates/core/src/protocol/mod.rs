//! Textual command vocabulary spoken between the control surface and the
//! engine.
//!
//! Requests are single lines of the form `<verb> [args...]`. Parsing happens
//! entirely on this side of the boundary: only a fully validated [`Command`]
//! is ever handed to the engine.

use std::{fmt, time::Duration};

use crate::{
    error::{ErrorKind, GazeError, ProtocolError},
    stimulus::Paradigm,
};

/// One entry of the allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbSpec {
    pub verb: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
}

/// Longest capture a single `record` may ask for.
pub const MAX_RECORD_DURATION: Duration = Duration::from_secs(60 * 60);

pub const RECORD_USAGE: &str = "record <n>s|<n>m";

pub const VERBS: &[VerbSpec] = &[
    VerbSpec {
        verb: "show",
        usage: "show <okn|pursuit|saccades>",
        description: "start presenting a paradigm and open a session",
    },
    VerbSpec {
        verb: "calibrate",
        usage: "calibrate",
        description: "run the five-point calibration",
    },
    VerbSpec {
        verb: "record",
        usage: RECORD_USAGE,
        description: "capture gaze for the given duration while presenting, at most 60m",
    },
    VerbSpec {
        verb: "stop",
        usage: "stop",
        description: "cancel whatever is running and return to idle",
    },
    VerbSpec {
        verb: "status",
        usage: "status",
        description: "report engine state",
    },
    VerbSpec {
        verb: "help",
        usage: "help",
        description: "show this message",
    },
    VerbSpec {
        verb: "exit",
        usage: "exit",
        description: "shut the engine down",
    },
];

fn lookup(verb: &str) -> Option<&'static VerbSpec> {
    VERBS.iter().find(|entry| entry.verb == verb)
}

/// Single-line summary of the allow-list.
pub fn help_text() -> String {
    let entries: Vec<String> = VERBS
        .iter()
        .map(|entry| format!("{}: {}", entry.usage, entry.description))
        .collect();
    format!("Supported commands: {}", entries.join("; "))
}

/// A validated request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Show(Paradigm),
    Calibrate,
    Record(Duration),
    Stop,
    Status,
    Help,
    Exit,
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Show(_) => "show",
            Command::Calibrate => "calibrate",
            Command::Record(_) => "record",
            Command::Stop => "stop",
            Command::Status => "status",
            Command::Help => "help",
            Command::Exit => "exit",
        }
    }
}

/// Validates a request line against the allow-list.
pub fn parse(line: &str) -> Result<Command, ProtocolError> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(ProtocolError::Empty)?;
    let args: Vec<&str> = words.collect();

    let entry = lookup(verb).ok_or_else(|| ProtocolError::UnknownVerb(verb.to_string()))?;
    let usage = || ProtocolError::Usage {
        verb: entry.verb,
        usage: entry.usage,
    };

    match (entry.verb, args.as_slice()) {
        ("show", [name]) => Paradigm::from_name(name).map(Command::Show).ok_or_else(usage),
        ("record", [duration]) => parse_duration(duration).map(Command::Record).ok_or_else(usage),
        ("calibrate", []) => Ok(Command::Calibrate),
        ("stop", []) => Ok(Command::Stop),
        ("status", []) => Ok(Command::Status),
        ("help", []) => Ok(Command::Help),
        ("exit", []) => Ok(Command::Exit),
        _ => Err(usage()),
    }
}

/// `<positive integer>s` or `<positive integer>m`, no longer than
/// [`MAX_RECORD_DURATION`].
fn parse_duration(text: &str) -> Option<Duration> {
    let (digits, scale) = if let Some(digits) = text.strip_suffix('s') {
        (digits, 1)
    } else if let Some(digits) = text.strip_suffix('m') {
        (digits, 60)
    } else {
        return None;
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = digits.parse().ok()?;
    if value == 0 {
        return None;
    }
    let duration = Duration::from_secs(value.checked_mul(scale)?);
    (duration <= MAX_RECORD_DURATION).then_some(duration)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ok(Option<String>),
    Error { kind: ErrorKind, detail: String },
}

/// The single reply to a request, correlated by sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub seq: u64,
    pub outcome: Outcome,
}

impl Acknowledgement {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            outcome: Outcome::Ok(None),
        }
    }

    pub fn ok_with(seq: u64, payload: impl Into<String>) -> Self {
        Self {
            seq,
            outcome: Outcome::Ok(Some(payload.into())),
        }
    }

    pub fn error(seq: u64, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            seq,
            outcome: Outcome::Error {
                kind,
                detail: detail.into(),
            },
        }
    }

    /// Failure acknowledgement for an error coming out of the engine. Errors
    /// outside the taxonomy are reported as state errors.
    pub fn failed(seq: u64, err: &GazeError) -> Self {
        let kind = err.kind().unwrap_or(ErrorKind::StateError);
        Self::error(seq, kind, err.to_string())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok(_))
    }

    pub fn payload(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Ok(payload) => payload.as_deref(),
            Outcome::Error { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Ok(_) => None,
            Outcome::Error { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for Acknowledgement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Ok(None) => write!(f, "{} ok", self.seq),
            Outcome::Ok(Some(payload)) => write!(f, "{} ok {}", self.seq, payload),
            Outcome::Error { kind, detail } => {
                write!(f, "{} error {} {:?}", self.seq, kind, detail)
            }
        }
    }
}

/// Prefix that marks a pushed notice on the wire.
pub const NOTICE_PREFIX: &str = "* ";

/// Asynchronous report pushed to the control surface, outside the
/// request/acknowledgement pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Event { name: &'static str, detail: String },
    Error { kind: ErrorKind, detail: String },
}

impl Notice {
    pub fn event(name: &'static str, detail: impl Into<String>) -> Self {
        Notice::Event {
            name,
            detail: detail.into(),
        }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Notice::Error {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::Event { name, detail } if detail.is_empty() => {
                write!(f, "{NOTICE_PREFIX}{name}")
            }
            Notice::Event { name, detail } => write!(f, "{NOTICE_PREFIX}{name} {detail}"),
            Notice::Error { kind, detail } => {
                write!(f, "{NOTICE_PREFIX}error {kind} {detail:?}")
            }
        }
    }
}

/// What a client makes of one line received from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyLine {
    Notice(String),
    Ack { seq: u64, ok: bool, text: String },
}

impl ReplyLine {
    pub fn classify(line: &str) -> Option<Self> {
        if let Some(notice) = line.strip_prefix(NOTICE_PREFIX) {
            return Some(ReplyLine::Notice(notice.to_string()));
        }
        let (seq, rest) = line.split_once(' ')?;
        let seq = seq.parse().ok()?;
        let ok = rest == "ok" || rest.starts_with("ok ");
        if !ok && !rest.starts_with("error ") {
            return None;
        }
        Some(ReplyLine::Ack {
            seq,
            ok,
            text: rest.to_string(),
        })
    }
}

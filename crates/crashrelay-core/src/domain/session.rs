//! Session domain entity
//!
//! A session tracks one run of the application and its terminal outcome.
//! It starts as `ok` and moves exactly once to one of the terminal states
//! `exited`, `crashed` or `abnormal`; later transition attempts are no-ops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::envelope::{Envelope, EnvelopeHeader, EnvelopeItem};

/// Status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Session is running normally
    Ok,
    /// Session ended cleanly
    Exited,
    /// Session ended with a crash
    Crashed,
    /// Session ended without a clean exit or crash report (e.g. hang, kill)
    Abnormal,
}

impl SessionStatus {
    /// Returns true once the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Ok)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        SessionStatus::Ok
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionStatus::Ok => "ok",
            SessionStatus::Exited => "exited",
            SessionStatus::Crashed => "crashed",
            SessionStatus::Abnormal => "abnormal",
        };
        write!(f, "{}", s)
    }
}

/// Release metadata attached to a session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// A tracked interval of application runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub sid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    #[serde(default)]
    pub init: bool,
    pub started: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub errors: u32,
    /// Seconds between `started` and the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default)]
    pub attrs: SessionAttributes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_mechanism: Option<String>,
}

impl Session {
    /// Creates a new `ok` session
    pub fn new(attrs: SessionAttributes, did: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            sid: Uuid::new_v4(),
            did,
            init: true,
            started: now,
            timestamp: now,
            status: SessionStatus::Ok,
            errors: 0,
            duration: Some(0.0),
            attrs,
            abnormal_mechanism: None,
        }
    }

    /// Refreshes `timestamp` and `duration`
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.timestamp = now;
        self.duration = Some((now - self.started).num_milliseconds().max(0) as f64 / 1000.0);
    }

    /// `ok -> exited`. Returns false when already terminal.
    pub fn end(&mut self) -> bool {
        self.transition(SessionStatus::Exited, false)
    }

    /// `ok -> crashed`, counting one error. Returns false when already terminal.
    pub fn mark_crashed(&mut self) -> bool {
        self.transition(SessionStatus::Crashed, true)
    }

    /// `ok -> abnormal` with the given mechanism. Returns false when already terminal.
    ///
    /// No error is counted; the caller decides whether the cause was one.
    pub fn mark_abnormal(&mut self, mechanism: Option<&str>) -> bool {
        let changed = self.transition(SessionStatus::Abnormal, false);
        if changed {
            self.abnormal_mechanism = mechanism.map(String::from);
        }
        changed
    }

    /// Counts one handled error without changing status
    pub fn record_error(&mut self) {
        if !self.status.is_terminal() {
            self.errors += 1;
            self.touch();
        }
    }

    fn transition(&mut self, to: SessionStatus, count_error: bool) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = to;
        if count_error {
            self.errors += 1;
        }
        self.touch();
        true
    }

    /// Wraps the session in a single-item envelope
    pub fn to_envelope(&self) -> Envelope {
        let mut envelope = Envelope::new(EnvelopeHeader {
            sent_at: Some(Utc::now()),
            ..EnvelopeHeader::default()
        });
        let payload = serde_json::to_value(self).unwrap_or_default();
        envelope.add_item(EnvelopeItem::json("session", payload));
        envelope
    }
}

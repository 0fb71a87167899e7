//! Domain newtypes
//!
//! Strongly-typed wrappers for identifiers and validated values that flow
//! through the pipeline.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// ProcessId
// ============================================================================

/// Identifier of a subordinate process, as assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Wrap a raw host process id
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ProcessId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

// ============================================================================
// EventId
// ============================================================================

/// Identifier of a telemetry event, serialized as 32 lowercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random EventId
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for EventId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for EventId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("{s}: {e}")))
    }
}

impl Serialize for EventId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Dsn
// ============================================================================

/// Parsed ingestion endpoint: `{scheme}://{public_key}@{host}[:port]/{project_id}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    raw: String,
    public_key: String,
    project_id: String,
    base: Url,
}

impl Dsn {
    /// Parse and validate a DSN string
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let url = Url::parse(raw).map_err(|e| DomainError::InvalidDsn(format!("{raw}: {e}")))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DomainError::InvalidDsn(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let public_key = url.username().to_string();
        if public_key.is_empty() {
            return Err(DomainError::InvalidDsn("missing public key".into()));
        }

        let project_id = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::InvalidDsn("missing project id".into()))?
            .to_string();

        let mut base = url.clone();
        base.set_username("")
            .map_err(|_| DomainError::InvalidDsn("cannot strip credentials".into()))?;
        base.set_password(None)
            .map_err(|_| DomainError::InvalidDsn("cannot strip credentials".into()))?;
        base.set_path("");
        base.set_query(None);

        Ok(Self {
            raw: raw.to_string(),
            public_key,
            project_id,
            base,
        })
    }

    /// Returns the public key used in the auth header
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// Returns the project id
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Returns the envelope submission URL
    pub fn envelope_url(&self) -> String {
        format!(
            "{}/api/{}/envelope/",
            self.base.as_str().trim_end_matches('/'),
            self.project_id
        )
    }

    /// Returns the original DSN string
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl Display for Dsn {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_simple_format() {
        let id = EventId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(!s.contains('-'));
        assert_eq!(s.parse::<EventId>().unwrap(), id);
    }

    #[test]
    fn test_event_id_serde() {
        let id = EventId::new();
        let json = serde_json::to_string(&id).unwrap();
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_dsn_parse() {
        let dsn = Dsn::parse("https://abc123@ingest.example.com/42").unwrap();
        assert_eq!(dsn.public_key(), "abc123");
        assert_eq!(dsn.project_id(), "42");
        assert_eq!(
            dsn.envelope_url(),
            "https://ingest.example.com/api/42/envelope/"
        );
    }

    #[test]
    fn test_dsn_with_port() {
        let dsn = Dsn::parse("http://key@127.0.0.1:9000/7").unwrap();
        assert_eq!(dsn.envelope_url(), "http://127.0.0.1:9000/api/7/envelope/");
    }

    #[test]
    fn test_dsn_rejects_missing_parts() {
        assert!(Dsn::parse("https://ingest.example.com/42").is_err());
        assert!(Dsn::parse("https://key@ingest.example.com/").is_err());
        assert!(Dsn::parse("ftp://key@ingest.example.com/1").is_err());
        assert!(Dsn::parse("garbage").is_err());
    }

    #[test]
    fn test_process_id_display() {
        assert_eq!(ProcessId::new(17).to_string(), "17");
        assert_eq!(ProcessId::from(3).get(), 3);
    }
}

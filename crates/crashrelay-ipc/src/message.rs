//! Inter-process message contract
//!
//! Six message kinds flow from subordinate processes to the coordinator.
//! Payloads are identical on both bindings:
//!
//! | kind             | payload                                   |
//! |------------------|-------------------------------------------|
//! | `start`          | empty                                     |
//! | `scope`          | JSON scope update                         |
//! | `event`          | JSON event                                |
//! | `envelope`       | raw envelope bytes                        |
//! | `status`         | JSON `{status: alive|visible|hidden, config}` |
//! | `structured-log` | JSON log record                           |
//!
//! On the direct channel a frame is one kind byte followed by the payload;
//! on the fallback channel the kind is the last route segment and the
//! payload is the request body.

use bytes::{BufMut, Bytes, BytesMut};
use crashrelay_core::domain::ScopeUpdate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::IpcError;

/// Discriminant of an inter-process message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Start = 0,
    Scope = 1,
    Event = 2,
    Envelope = 3,
    Status = 4,
    StructuredLog = 5,
}

impl MessageKind {
    pub const ALL: [MessageKind; 6] = [
        MessageKind::Start,
        MessageKind::Scope,
        MessageKind::Event,
        MessageKind::Envelope,
        MessageKind::Status,
        MessageKind::StructuredLog,
    ];

    /// Route segment used by the fallback channel
    pub fn route(self) -> &'static str {
        match self {
            MessageKind::Start => "start",
            MessageKind::Scope => "scope",
            MessageKind::Event => "event",
            MessageKind::Envelope => "envelope",
            MessageKind::Status => "status",
            MessageKind::StructuredLog => "structured-log",
        }
    }

    pub fn from_route(route: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.route() == route)
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| *k as u8 == byte)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.route())
    }
}

/// Visibility reported by a subordinate's heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Alive,
    Visible,
    Hidden,
}

/// Payload of a `status` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ProcessStatus,
    #[serde(default)]
    pub config: Value,
}

/// A decoded inter-process message
#[derive(Debug, Clone, PartialEq)]
pub enum IpcMessage {
    Start,
    Scope(ScopeUpdate),
    Event(Value),
    Envelope(Bytes),
    Status(StatusReport),
    StructuredLog(Value),
}

impl IpcMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            IpcMessage::Start => MessageKind::Start,
            IpcMessage::Scope(_) => MessageKind::Scope,
            IpcMessage::Event(_) => MessageKind::Event,
            IpcMessage::Envelope(_) => MessageKind::Envelope,
            IpcMessage::Status(_) => MessageKind::Status,
            IpcMessage::StructuredLog(_) => MessageKind::StructuredLog,
        }
    }

    /// Encodes the payload shared by both bindings
    pub fn to_payload(&self) -> Result<Bytes, IpcError> {
        let json = |v: serde_json::Result<Vec<u8>>| {
            v.map(Bytes::from).map_err(|e| IpcError::Malformed {
                kind: self.kind(),
                reason: e.to_string(),
            })
        };
        match self {
            IpcMessage::Start => Ok(Bytes::new()),
            IpcMessage::Scope(update) => json(serde_json::to_vec(update)),
            IpcMessage::Event(event) => json(serde_json::to_vec(event)),
            IpcMessage::Envelope(bytes) => Ok(bytes.clone()),
            IpcMessage::Status(status) => json(serde_json::to_vec(status)),
            IpcMessage::StructuredLog(log) => json(serde_json::to_vec(log)),
        }
    }

    /// Decodes a payload of the given kind
    pub fn from_payload(kind: MessageKind, payload: Bytes) -> Result<Self, IpcError> {
        let malformed = |e: serde_json::Error| IpcError::Malformed {
            kind,
            reason: e.to_string(),
        };
        Ok(match kind {
            MessageKind::Start => IpcMessage::Start,
            MessageKind::Scope => IpcMessage::Scope(serde_json::from_slice(&payload).map_err(malformed)?),
            MessageKind::Event => {
                let value: Value = serde_json::from_slice(&payload).map_err(malformed)?;
                if !value.is_object() {
                    return Err(IpcError::Malformed {
                        kind,
                        reason: "event is not a JSON object".into(),
                    });
                }
                IpcMessage::Event(value)
            }
            MessageKind::Envelope => IpcMessage::Envelope(payload),
            MessageKind::Status => IpcMessage::Status(serde_json::from_slice(&payload).map_err(malformed)?),
            MessageKind::StructuredLog => {
                IpcMessage::StructuredLog(serde_json::from_slice(&payload).map_err(malformed)?)
            }
        })
    }

    /// Direct-channel frame: kind byte followed by the payload
    pub fn to_frame(&self) -> Result<Bytes, IpcError> {
        let payload = self.to_payload()?;
        let mut frame = BytesMut::with_capacity(payload.len() + 1);
        frame.put_u8(self.kind() as u8);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    pub fn from_frame(mut frame: Bytes) -> Result<Self, IpcError> {
        if frame.is_empty() {
            return Err(IpcError::UnknownKind("empty frame".into()));
        }
        let tag = frame.split_to(1)[0];
        let kind = MessageKind::from_byte(tag).ok_or_else(|| IpcError::UnknownKind(format!("0x{tag:02x}")))?;
        Self::from_payload(kind, frame)
    }
}

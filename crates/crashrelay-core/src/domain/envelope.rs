//! Envelope wire format
//!
//! An envelope is a newline-delimited container: one JSON header line
//! followed by repeating `(item header line, payload)` pairs. A payload is
//! either one JSON line, or exactly `length` raw bytes when the item header
//! declares a length.
//!
//! ```text
//! {"event_id":"...","sent_at":"..."}
//! {"type":"event"}
//! {"message":"boom"}
//! {"type":"attachment","length":4,"filename":"a.bin"}
//! \x00\x01\x02\x03
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::DomainError;
use super::newtypes::EventId;

// ============================================================================
// Headers
// ============================================================================

/// Envelope-level header
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    /// Any other header fields (e.g. `trace`, `sdk`), carried through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-item header. `type` discriminates the payload kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemHeader {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ItemHeader {
    /// Creates a header of the given type with no extra fields
    pub fn new(ty: impl Into<String>) -> Self {
        Self {
            ty: ty.into(),
            length: None,
            extra: Map::new(),
        }
    }

    /// Returns the typed kind of this item
    pub fn kind(&self) -> ItemKind {
        ItemKind::from_type(&self.ty)
    }

    fn extra_str(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(Value::as_str).map(String::from)
    }
}

/// Known item kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Event,
    Transaction,
    Feedback,
    Session,
    Sessions,
    Attachment,
    Profile,
    ProfileChunk,
    ReplayEvent,
    ReplayRecording,
    Log,
    Metric,
    ClientReport,
    Other(String),
}

impl ItemKind {
    /// Maps an item header `type` to its kind
    pub fn from_type(ty: &str) -> Self {
        match ty {
            "event" => ItemKind::Event,
            "transaction" => ItemKind::Transaction,
            "feedback" => ItemKind::Feedback,
            "session" => ItemKind::Session,
            "sessions" => ItemKind::Sessions,
            "attachment" => ItemKind::Attachment,
            "profile" => ItemKind::Profile,
            "profile_chunk" => ItemKind::ProfileChunk,
            "replay_event" => ItemKind::ReplayEvent,
            "replay_recording" => ItemKind::ReplayRecording,
            "log" => ItemKind::Log,
            "metric" | "statsd" | "trace_metric" => ItemKind::Metric,
            "client_report" => ItemKind::ClientReport,
            other => ItemKind::Other(other.to_string()),
        }
    }

    /// Rate-limit category this kind is counted against
    pub fn rate_limit_category(&self) -> &str {
        match self {
            ItemKind::Event => "error",
            ItemKind::Transaction => "transaction",
            ItemKind::Feedback => "feedback",
            ItemKind::Session | ItemKind::Sessions => "session",
            ItemKind::Attachment => "attachment",
            ItemKind::Profile | ItemKind::ProfileChunk => "profile",
            ItemKind::ReplayEvent | ItemKind::ReplayRecording => "replay",
            ItemKind::Log => "log_item",
            ItemKind::Metric => "metric",
            ItemKind::ClientReport => "internal",
            ItemKind::Other(ty) => ty,
        }
    }

    /// Returns true for the kinds that carry an event body
    pub fn is_event_like(&self) -> bool {
        matches!(
            self,
            ItemKind::Event | ItemKind::Transaction | ItemKind::Feedback
        )
    }
}

// ============================================================================
// Items
// ============================================================================

/// Item payload
#[derive(Debug, Clone, PartialEq)]
pub enum ItemPayload {
    /// A single JSON value written on one line
    Json(Value),
    /// Raw bytes whose length is declared in the item header
    Raw(Vec<u8>),
}

/// One `(header, payload)` pair
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeItem {
    pub header: ItemHeader,
    pub payload: ItemPayload,
}

impl EnvelopeItem {
    /// Creates a JSON item of the given type
    pub fn json(ty: impl Into<String>, value: Value) -> Self {
        Self {
            header: ItemHeader::new(ty),
            payload: ItemPayload::Json(value),
        }
    }

    /// Creates a raw item of the given type; `length` is filled on serialization
    pub fn raw(ty: impl Into<String>, data: Vec<u8>) -> Self {
        let mut header = ItemHeader::new(ty);
        header.length = Some(data.len());
        Self {
            header,
            payload: ItemPayload::Raw(data),
        }
    }

    /// Returns the typed kind of this item
    pub fn kind(&self) -> ItemKind {
        self.header.kind()
    }

    /// Returns the payload as JSON, decoding raw bytes if needed
    pub fn payload_json(&self) -> Option<Value> {
        match &self.payload {
            ItemPayload::Json(v) => Some(v.clone()),
            ItemPayload::Raw(bytes) => serde_json::from_slice(bytes).ok(),
        }
    }
}

/// A file attached to an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: Option<String>,
    pub attachment_type: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    /// Attachment type used for native crash dumps
    pub const MINIDUMP: &'static str = "event.minidump";

    /// Creates an attachment with no content or attachment type
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type: None,
            attachment_type: None,
            data,
        }
    }

    /// Creates a minidump attachment
    pub fn minidump(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            attachment_type: Some(Self::MINIDUMP.to_string()),
            ..Self::new(filename, data)
        }
    }

    /// Converts this attachment into a raw envelope item
    pub fn to_item(&self) -> EnvelopeItem {
        let mut item = EnvelopeItem::raw("attachment", self.data.clone());
        item.header
            .extra
            .insert("filename".into(), Value::String(self.filename.clone()));
        if let Some(ct) = &self.content_type {
            item.header
                .extra
                .insert("content_type".into(), Value::String(ct.clone()));
        }
        if let Some(at) = &self.attachment_type {
            item.header
                .extra
                .insert("attachment_type".into(), Value::String(at.clone()));
        }
        item
    }

    fn from_item(item: &EnvelopeItem) -> Self {
        let data = match &item.payload {
            ItemPayload::Raw(bytes) => bytes.clone(),
            ItemPayload::Json(v) => v.to_string().into_bytes(),
        };
        Self {
            filename: item
                .header
                .extra_str("filename")
                .unwrap_or_else(|| "attachment".to_string()),
            content_type: item.header.extra_str("content_type"),
            attachment_type: item.header.extra_str("attachment_type"),
            data,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// The wire container bundling telemetry items with a shared header
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub header: EnvelopeHeader,
    pub items: Vec<EnvelopeItem>,
}

/// Event pulled out of an envelope together with its attachments
#[derive(Debug, Clone, PartialEq)]
pub struct EventWithAttachments {
    pub event: Value,
    pub attachments: Vec<Attachment>,
    pub profile: Option<Value>,
}

impl Envelope {
    /// Creates an empty envelope with the given header
    pub fn new(header: EnvelopeHeader) -> Self {
        Self {
            header,
            items: Vec::new(),
        }
    }

    /// Builds an envelope around one event and its attachments
    pub fn from_event(event: Value, attachments: &[Attachment]) -> Self {
        let event_id = event
            .get("event_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok());
        let ty = match event.get("type").and_then(Value::as_str) {
            Some("transaction") => "transaction",
            Some("feedback") => "feedback",
            _ => "event",
        };

        let mut envelope = Self::new(EnvelopeHeader {
            event_id,
            sent_at: Some(Utc::now()),
            ..EnvelopeHeader::default()
        });
        envelope.items.push(EnvelopeItem::json(ty, event));
        envelope
            .items
            .extend(attachments.iter().map(Attachment::to_item));
        envelope
    }

    /// Appends an item
    pub fn add_item(&mut self, item: EnvelopeItem) {
        self.items.push(item);
    }

    /// Calls `visit` with every item and its kind until it returns `false`
    pub fn for_each_item<F>(&self, mut visit: F)
    where
        F: FnMut(&EnvelopeItem, ItemKind) -> bool,
    {
        for item in &self.items {
            if !visit(item, item.kind()) {
                break;
            }
        }
    }

    /// Returns the distinct rate-limit categories of the items, in first-seen order
    pub fn categories(&self) -> Vec<String> {
        let mut categories: Vec<String> = Vec::new();
        for item in &self.items {
            let kind = item.kind();
            let category = kind.rate_limit_category();
            if !categories.iter().any(|c| c == category) {
                categories.push(category.to_string());
            }
        }
        categories
    }

    /// Pulls the first event/transaction/feedback plus attachments and profile.
    ///
    /// Returns `None` when the envelope holds no event-like item, in which
    /// case it should be forwarded opaquely.
    pub fn event_with_attachments(&self) -> Option<EventWithAttachments> {
        let mut event: Option<Value> = None;
        let mut attachments = Vec::new();
        let mut profile = None;

        self.for_each_item(|item, kind| {
            match kind {
                k if k.is_event_like() => {
                    if event.is_none() {
                        event = item.payload_json();
                    }
                }
                ItemKind::Attachment => attachments.push(Attachment::from_item(item)),
                ItemKind::Profile => profile = item.payload_json(),
                _ => {}
            }
            true
        });

        event.map(|event| EventWithAttachments {
            event,
            attachments,
            profile,
        })
    }

    // ------------------------------------------------------------------------
    // Codec
    // ------------------------------------------------------------------------

    /// Serializes the envelope to its wire representation
    pub fn to_bytes(&self) -> Result<Vec<u8>, DomainError> {
        let mut out = serde_json::to_vec(&self.header)
            .map_err(|e| DomainError::Format(format!("envelope header: {e}")))?;

        for item in &self.items {
            let mut header = item.header.clone();
            let payload = match &item.payload {
                ItemPayload::Json(value) => {
                    header.length = None;
                    serde_json::to_vec(value)
                        .map_err(|e| DomainError::Format(format!("item payload: {e}")))?
                }
                ItemPayload::Raw(bytes) => {
                    header.length = Some(bytes.len());
                    bytes.clone()
                }
            };

            out.push(b'\n');
            serde_json::to_writer(&mut out, &header)
                .map_err(|e| DomainError::Format(format!("item header: {e}")))?;
            out.push(b'\n');
            out.extend_from_slice(&payload);
        }

        Ok(out)
    }

    /// Parses an envelope from its wire representation
    pub fn parse(bytes: &[u8]) -> Result<Self, DomainError> {
        let mut reader = LineReader::new(bytes);

        let header_line = reader.read_line();
        let header: EnvelopeHeader = serde_json::from_slice(header_line)
            .map_err(|e| DomainError::Format(format!("envelope header: {e}")))?;

        let mut items = Vec::new();
        while !reader.is_empty() {
            let line = reader.read_line();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let item_header: ItemHeader = serde_json::from_slice(line)
                .map_err(|e| DomainError::Format(format!("item header: {e}")))?;

            let payload = match item_header.length {
                Some(length) => ItemPayload::Raw(reader.read_exact(length)?.to_vec()),
                None => {
                    let line = reader.read_line();
                    ItemPayload::Json(
                        serde_json::from_slice(line)
                            .map_err(|e| DomainError::Format(format!("item payload: {e}")))?,
                    )
                }
            };

            items.push(EnvelopeItem {
                header: item_header,
                payload,
            });
        }

        Ok(Self { header, items })
    }
}

/// Cursor over an envelope buffer
struct LineReader<'a> {
    buf: &'a [u8],
}

impl<'a> LineReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes up to the next `\n` (consumed, not returned) or the end
    fn read_line(&mut self) -> &'a [u8] {
        let end = self
            .buf
            .iter()
            .position(|&b| b == b'\n')
            .unwrap_or(self.buf.len());
        let line = &self.buf[..end];
        self.buf = self.buf.get(end + 1..).unwrap_or(&[]);
        line
    }

    /// Exactly `length` bytes, then one trailing newline if present
    fn read_exact(&mut self, length: usize) -> Result<&'a [u8], DomainError> {
        if length > self.buf.len() {
            return Err(DomainError::Format(format!(
                "item declares {length} bytes but only {} remain",
                self.buf.len()
            )));
        }
        let data = &self.buf[..length];
        self.buf = &self.buf[length..];
        if self.buf.first() == Some(&b'\n') {
            self.buf = &self.buf[1..];
        }
        Ok(data)
    }
}

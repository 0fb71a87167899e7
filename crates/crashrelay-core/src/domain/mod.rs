//! Domain entities and business logic
//!
//! This module contains the core domain types for the delivery pipeline:
//! - Newtypes for type-safe identifiers and the parsed DSN
//! - The envelope wire format and its codec
//! - The session state machine
//! - Scope merging and persisted scope snapshots
//! - Event and log shaping helpers
//! - Domain-specific error types

pub mod envelope;
pub mod errors;
pub mod event;
pub mod newtypes;
pub mod scope;
pub mod session;

// Re-export commonly used types
pub use envelope::{
    Attachment, Envelope, EnvelopeHeader, EnvelopeItem, EventWithAttachments, ItemHeader,
    ItemKind, ItemPayload,
};
pub use errors::DomainError;
pub use event::ReleaseInfo;
pub use newtypes::*;
pub use scope::{Scope, ScopeAttachment, ScopeSnapshot, ScopeUpdate, DEFAULT_MAX_BREADCRUMBS};
pub use session::{Session, SessionAttributes, SessionStatus};

//! Port definitions (hexagonal architecture interfaces)
//!
//! Ports are the interfaces the pipeline depends on but whose
//! implementations live in the composition root or in tests.
//!
//! ## Ports Overview
//!
//! - [`IEnvelopeTransport`] - Outbound delivery of serialized envelopes
//! - [`IProcessHost`] - Facts about subordinate processes (liveness, names,
//!   per-process identifiers)
//! - [`LifecycleHooks`] - Subscription registry for application lifecycle
//!   events such as `before-quit` and `will-quit`

pub mod host;
pub mod lifecycle;
pub mod transport;

pub use host::{ExitReason, HostEvent, IProcessHost};
pub use lifecycle::{LifecycleEvent, LifecycleHooks, ListenerId, QuitEvent};
pub use transport::{IEnvelopeTransport, TransportResponse};

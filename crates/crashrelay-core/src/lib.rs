//! Crashrelay Core - Domain types and ports for the crash delivery pipeline
//!
//! This crate contains:
//! - **Configuration** - YAML-backed [`config::Config`] with validation
//! - **Domain entities** - `Envelope`, `Session`, `Scope`, identifiers and the DSN
//! - **Port definitions** - `IProcessHost` and the `LifecycleHooks` registry
//!
//! # Architecture
//!
//! The domain module holds pure data types and their codecs. Ports define
//! the interfaces that the coordinator needs from its host; adapter crates
//! and the daemon implement them.

pub mod config;
pub mod domain;
pub mod ports;

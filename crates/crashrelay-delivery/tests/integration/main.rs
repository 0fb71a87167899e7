//! Integration tests for crashrelay-delivery
//!
//! Uses wiremock to stand in for the ingestion endpoint and verifies the
//! HTTP transport, the send-or-queue path and coordinator startup end to end.

mod common;

mod test_offline;
mod test_startup;
mod test_transport;

//! Client-side ingestion and aggregation of live physics-simulation streams.
//!
//! The crate is organized by transport surface:
//! - `stream`: event-stream transport, frame classification, series
//!   aggregation and the session controller that ties them together.
//! - `sim_api`: HTTP client for submitting runs and fetching stored ones.
//! - `retry`: reconnect and retry policies shared by both.

/// Reconnect and retry policies.
pub mod retry;
/// Simulation service run endpoints.
pub mod sim_api;
/// Live simulation stream client, protocol types, aggregation and sessions.
pub mod stream;

//! Live simulation stream modules.
//!
//! - `client`: event-stream transport with fixed-interval reconnects.
//! - `proto`: frame payload types and the message classifier.
//! - `series`: per-agent time series accumulated from data frames.
//! - `session`: single-owner controller that publishes aggregate snapshots.

/// Event-stream connection and reconnect worker.
pub mod client;
/// Stream payload types and classification.
pub mod proto;
/// Time series aggregation.
pub mod series;
/// Session controller emitting typed events.
pub mod session;

pub use client::{StreamClient, StreamClientError, StreamConnection, TransportEvent};
pub use proto::{classify, AgentId, AgentState, Frame, StreamMessage, Vector3};
pub use series::{AggregateState, AgentSeries, TimeSeries};
pub use session::{CloseReason, ConnectionState, SessionEvent, SimulationSession};

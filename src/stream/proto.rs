use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Top-level keys that carry frame metadata rather than agent state.
pub const METADATA_KEYS: [&str; 2] = ["time", "timeStep"];

/// Opaque, stable name of one tracked body.
pub type AgentId = String;

/// Agent states of one frame keyed by agent id.
pub type Frame = BTreeMap<AgentId, AgentState>;

/// Cartesian triple in the producer's simulation units.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Vector3 {
    /// X component.
    pub x: f64,
    /// Y component.
    pub y: f64,
    /// Z component.
    pub z: f64,
}

impl Vector3 {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Instantaneous kinematic state of one body.
///
/// Extra fields sent by the producer (`mass`, per-agent `time`) are ignored.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentState {
    /// Position at the frame's simulation time.
    pub position: Vector3,
    /// Velocity at the frame's simulation time.
    pub velocity: Vector3,
}

/// Agent entry that failed validation and was left out of its frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedEntry {
    pub agent: AgentId,
    pub reason: String,
}

/// Data frame after metadata filtering and per-entry validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedFrame {
    /// Entries that decoded into a complete [`AgentState`].
    pub agents: Frame,
    /// Entries dropped individually; the rest of the frame is still valid.
    pub rejected: Vec<RejectedEntry>,
}

/// One classified inbound stream payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    /// Liveness marker, `{"heartbeat": true}`.
    Heartbeat,
    /// Producer finished the run, `{"complete": true}`.
    Complete,
    /// Application-level error reported by the producer, `{"error": "..."}`.
    ErrorSignal(String),
    /// Mapping of agent id to agent state.
    DataFrame(DecodedFrame),
}

/// Reasons a payload could not be classified. The payload is dropped.
#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a json object")]
    NotAnObject,

    #[error("frame contained no valid agent entries ({rejected} rejected)")]
    EmptyFrame { rejected: usize },
}

/// Decodes one raw stream payload into exactly one [`StreamMessage`].
///
/// Control markers take precedence over agent data in the same object, in
/// the order heartbeat, complete, error.
pub fn classify(raw: &str) -> Result<StreamMessage, ClassifyError> {
    let value: Value = serde_json::from_str(raw)?;
    let Value::Object(object) = value else {
        return Err(ClassifyError::NotAnObject);
    };

    if is_flag_set(&object, "heartbeat") {
        return Ok(StreamMessage::Heartbeat);
    }
    if is_flag_set(&object, "complete") {
        return Ok(StreamMessage::Complete);
    }
    if let Some(Value::String(message)) = object.get("error") {
        return Ok(StreamMessage::ErrorSignal(message.clone()));
    }

    decode_frame(object).map(StreamMessage::DataFrame)
}

/// Decodes a json object of agent entries into a [`DecodedFrame`].
///
/// Metadata keys are filtered before validation. Each remaining entry is
/// validated on its own; failures are collected in
/// [`DecodedFrame::rejected`]. Fails only when no entry survives.
pub fn decode_frame(object: Map<String, Value>) -> Result<DecodedFrame, ClassifyError> {
    let mut decoded = DecodedFrame::default();

    for (agent, entry) in object {
        if METADATA_KEYS.contains(&agent.as_str()) {
            continue;
        }
        match serde_json::from_value::<AgentState>(entry) {
            Ok(state) => {
                decoded.agents.insert(agent, state);
            }
            Err(err) => decoded.rejected.push(RejectedEntry {
                agent,
                reason: err.to_string(),
            }),
        }
    }

    if decoded.agents.is_empty() {
        return Err(ClassifyError::EmptyFrame {
            rejected: decoded.rejected.len(),
        });
    }
    Ok(decoded)
}

fn is_flag_set(object: &Map<String, Value>, key: &str) -> bool {
    matches!(object.get(key), Some(Value::Bool(true)))
}

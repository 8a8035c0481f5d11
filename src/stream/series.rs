//! Accumulated per-agent time series built from classified data frames.
//!
//! [`AggregateState`] only grows during a session: series are append-only,
//! the initial snapshot is first-frame-wins, and the latest frame is replaced
//! wholesale on every ingest.
//!
//! Series history lives in fixed-size sealed chunks behind `Arc`, so cloning
//! an [`AggregateState`] for a published snapshot copies per-agent tails and
//! chunk handles, never the samples of earlier frames.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::stream::proto::{AgentId, AgentState, Frame, Vector3};

/// Samples per sealed chunk.
const CHUNK_LEN: usize = 64;

/// Append-only vector whose full chunks are shared between clones.
#[derive(Clone, Debug)]
struct ChunkedVec<T> {
    sealed: Arc<Vec<Arc<[T]>>>,
    tail: Vec<T>,
}

impl<T> Default for ChunkedVec<T> {
    fn default() -> Self {
        Self {
            sealed: Arc::new(Vec::new()),
            tail: Vec::new(),
        }
    }
}

impl<T: Copy> ChunkedVec<T> {
    fn push(&mut self, value: T) {
        if self.tail.capacity() == 0 {
            self.tail.reserve_exact(CHUNK_LEN);
        }
        self.tail.push(value);
        if self.tail.len() == CHUNK_LEN {
            let chunk: Arc<[T]> = std::mem::take(&mut self.tail).into();
            Arc::make_mut(&mut self.sealed).push(chunk);
        }
    }

    fn len(&self) -> usize {
        self.sealed.len() * CHUNK_LEN + self.tail.len()
    }

    fn get(&self, index: usize) -> Option<T> {
        let chunk = index / CHUNK_LEN;
        match self.sealed.get(chunk) {
            Some(sealed) => sealed.get(index % CHUNK_LEN).copied(),
            None => self.tail.get(index - self.sealed.len() * CHUNK_LEN).copied(),
        }
    }

    fn iter(&self) -> impl Iterator<Item = T> + '_ {
        self.sealed
            .iter()
            .flat_map(|chunk| chunk.iter())
            .chain(self.tail.iter())
            .copied()
    }
}

/// Append-only sequence of [`Vector3`] samples in arrival order.
///
/// Serializes column-wise (`{"x": [...], "y": [...], "z": [...]}`) so a
/// renderer can plot each axis directly.
#[derive(Clone, Debug, Default)]
pub struct TimeSeries {
    samples: ChunkedVec<Vector3>,
}

impl TimeSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one sample. Earlier samples are never touched.
    pub fn push(&mut self, sample: Vector3) {
        self.samples.push(sample);
    }

    /// Number of samples recorded.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `x` column, oldest first.
    pub fn x(&self) -> Vec<f64> {
        self.iter().map(|sample| sample.x).collect()
    }

    /// The `y` column, oldest first.
    pub fn y(&self) -> Vec<f64> {
        self.iter().map(|sample| sample.y).collect()
    }

    /// The `z` column, oldest first.
    pub fn z(&self) -> Vec<f64> {
        self.iter().map(|sample| sample.z).collect()
    }

    /// Returns the sample at `index`, if any.
    pub fn get(&self, index: usize) -> Option<Vector3> {
        self.samples.get(index)
    }

    /// Most recent sample.
    pub fn last(&self) -> Option<Vector3> {
        self.len().checked_sub(1).and_then(|index| self.get(index))
    }

    /// Samples in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = Vector3> + '_ {
        self.samples.iter()
    }

    #[cfg(test)]
    pub(crate) fn shares_history_with(&self, other: &TimeSeries) -> bool {
        Arc::ptr_eq(&self.samples.sealed, &other.samples.sealed)
            || self
                .samples
                .sealed
                .iter()
                .zip(other.samples.sealed.iter())
                .all(|(left, right)| Arc::ptr_eq(left, right))
    }
}

impl PartialEq for TimeSeries {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().eq(other.iter())
    }
}

impl Serialize for TimeSeries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut columns = serializer.serialize_struct("TimeSeries", 3)?;
        columns.serialize_field("x", &self.x())?;
        columns.serialize_field("y", &self.y())?;
        columns.serialize_field("z", &self.z())?;
        columns.end()
    }
}

/// Position and velocity history of one agent, always appended together.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AgentSeries {
    position: TimeSeries,
    velocity: TimeSeries,
}

impl AgentSeries {
    /// Position samples, one per frame the agent appeared in.
    pub fn position(&self) -> &TimeSeries {
        &self.position
    }

    /// Velocity samples, index-aligned with [`AgentSeries::position`].
    pub fn velocity(&self) -> &TimeSeries {
        &self.velocity
    }

    /// Number of frames this agent validly appeared in.
    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    fn push(&mut self, state: &AgentState) {
        self.position.push(state.position);
        self.velocity.push(state.velocity);
    }
}

/// Renderer-ready state accumulated over one visualization session.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AggregateState {
    series: BTreeMap<AgentId, AgentSeries>,
    initial_snapshot: Frame,
    latest_frame: Frame,
    frames_ingested: u64,
}

impl AggregateState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a recorded sequence of frames into a fresh state, in order.
    pub fn from_frames<I>(frames: I) -> Self
    where
        I: IntoIterator<Item = Frame>,
    {
        frames.into_iter().fold(Self::new(), apply)
    }

    /// Applies one data frame in place.
    ///
    /// Unseen agents get an empty series pair and their first-observed state
    /// as snapshot. Existing snapshot entries are never overwritten.
    pub fn ingest(&mut self, frame: Frame) {
        for (agent, state) in &frame {
            self.series.entry(agent.clone()).or_default().push(state);
            self.initial_snapshot
                .entry(agent.clone())
                .or_insert(*state);
        }
        self.latest_frame = frame;
        self.frames_ingested += 1;
    }

    pub fn series(&self) -> &BTreeMap<AgentId, AgentSeries> {
        &self.series
    }

    pub fn series_for(&self, agent: &str) -> Option<&AgentSeries> {
        self.series.get(agent)
    }

    pub fn initial_snapshot(&self) -> &Frame {
        &self.initial_snapshot
    }

    /// Agents of the most recently ingested frame only.
    pub fn latest_frame(&self) -> &Frame {
        &self.latest_frame
    }

    pub fn frames_ingested(&self) -> u64 {
        self.frames_ingested
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &AgentId> + '_ {
        self.series.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Pure transition: returns `state` with `frame` ingested.
pub fn apply(state: AggregateState, frame: Frame) -> AggregateState {
    let mut next = state;
    next.ingest(frame);
    next
}

//! HTTP client for the simulation service's run endpoints.
//!
//! Submits initial conditions for a new run and fetches the most recently
//! stored run, which can be replayed into an [`AggregateState`] without
//! opening a live stream.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::retry::{retry_async, RetryPolicy};
use crate::stream::proto::{decode_frame, AgentId, Frame, Vector3};
use crate::stream::series::AggregateState;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
pub const SIMULATION_API_BASE_URL: &str = "http://localhost:8000";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SimApiDefaults;

impl SimApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(25);
}

#[derive(Clone, Debug)]
pub struct SimApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for SimApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: SimApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: SimApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::fixed_interval(SimApiDefaults::BACKOFF)
                .with_max_attempts(SimApiDefaults::MAX_ATTEMPTS)
                .with_jitter(SimApiDefaults::JITTER),
        }
    }
}

/// Initial state of one body for a new run.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BodyConditions {
    pub position: Vector3,
    pub velocity: Vector3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mass: Option<f64>,
}

/// Per-body initial conditions submitted to start a run.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct InitialConditions {
    pub bodies: BTreeMap<AgentId, BodyConditions>,
}

impl InitialConditions {
    /// The two-body setup the service expects out of the box.
    pub fn default_two_body() -> Self {
        Self::default()
            .with_body(
                "Body1",
                BodyConditions {
                    position: Vector3::new(-0.73, 0.0, 0.0),
                    velocity: Vector3::new(0.0, -0.0015, 0.0),
                    mass: Some(1.0),
                },
            )
            .with_body(
                "Body2",
                BodyConditions {
                    position: Vector3::new(60.34, 0.0, 0.0),
                    velocity: Vector3::new(0.0, 0.13, 0.0),
                    mass: Some(0.0123),
                },
            )
    }

    pub fn with_body(mut self, agent: impl Into<AgentId>, body: BodyConditions) -> Self {
        self.bodies.insert(agent.into(), body);
        self
    }

    /// Flattens the conditions into the `Body1.position.x=...` query
    /// parameters understood by the stream endpoint.
    pub fn stream_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (agent, body) in &self.bodies {
            for (quantity, vector) in [("position", body.position), ("velocity", body.velocity)] {
                for (axis, value) in [("x", vector.x), ("y", vector.y), ("z", vector.z)] {
                    pairs.push((format!("{agent}.{quantity}.{axis}"), value.to_string()));
                }
            }
            if let Some(mass) = body.mass {
                pairs.push((format!("{agent}.mass"), mass.to_string()));
            }
        }
        pairs
    }
}

/// One stored simulation record: a time range and the frame it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordedFrame {
    pub start: f64,
    pub end: f64,
    pub frame: Frame,
}

#[derive(Clone, Debug)]
pub struct SimApiClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl SimApiClient {
    pub fn new() -> Result<Self, SimApiError> {
        Self::with_options(SimApiClientOptions::default())
    }

    pub fn with_options(options: SimApiClientOptions) -> Result<Self, SimApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(SimApiError::Transport)?;

        Ok(Self {
            http,
            base_url: SIMULATION_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Starts a new run with the given initial conditions.
    pub async fn submit_run(&self, conditions: &InitialConditions) -> Result<(), SimApiError> {
        let endpoint = self.endpoint("/simulation");
        retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.post_attempt(&endpoint, conditions).await }
            },
            SimApiError::is_retryable,
        )
        .await?;
        info!(event = "simulation_submitted", bodies = conditions.bodies.len());
        Ok(())
    }

    /// Fetches the most recently stored run.
    ///
    /// Records whose frame holds no valid agent are skipped, matching how the
    /// live stream drops empty frames.
    pub async fn latest_run(&self) -> Result<Vec<RecordedFrame>, SimApiError> {
        let endpoint = self.endpoint("/simulation");
        let body = retry_async(
            &self.retry_policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.get_attempt(&endpoint).await }
            },
            SimApiError::is_retryable,
        )
        .await?;
        parse_recorded_run(&body)
    }

    /// Fetches the most recently stored run and folds it into a fresh
    /// aggregate.
    pub async fn replay_latest(&self) -> Result<AggregateState, SimApiError> {
        let run = self.latest_run().await?;
        Ok(AggregateState::from_frames(
            run.into_iter().map(|record| record.frame),
        ))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_attempt(
        &self,
        endpoint: &str,
        conditions: &InitialConditions,
    ) -> Result<(), SimApiError> {
        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .json(conditions)
            .send()
            .await
            .map_err(SimApiError::Transport)?;
        read_success_body(response).await.map(|_| ())
    }

    async fn get_attempt(&self, endpoint: &str) -> Result<String, SimApiError> {
        let response = self
            .http
            .get(endpoint)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(SimApiError::Transport)?;
        read_success_body(response).await
    }
}

#[derive(Debug, Error)]
pub enum SimApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl SimApiError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

async fn read_success_body(response: reqwest::Response) -> Result<String, SimApiError> {
    let status = response.status();
    let body = response.text().await.map_err(SimApiError::Transport)?;
    if !status.is_success() {
        return Err(SimApiError::HttpStatus {
            status,
            body: summarize_error_body(&body),
        });
    }
    Ok(body)
}

fn parse_recorded_run(body: &str) -> Result<Vec<RecordedFrame>, SimApiError> {
    let records: Vec<(f64, f64, Value)> = serde_json::from_str(body)
        .map_err(|err| SimApiError::Parse(format!("expected [t0, t1, frame] records: {err}")))?;

    Ok(records
        .into_iter()
        .filter_map(|(start, end, frame)| {
            let Value::Object(object) = frame else {
                return None;
            };
            let decoded = decode_frame(object).ok()?;
            Some(RecordedFrame {
                start,
                end,
                frame: decoded.agents,
            })
        })
        .collect())
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

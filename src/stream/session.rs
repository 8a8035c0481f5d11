//! Session controller tying the transport, classifier and aggregator
//! together.
//!
//! `SimulationSession` is the single owner of the stream connection and the
//! live [`AggregateState`]. It consumes transport events one at a time,
//! classifies each payload, folds data frames into the aggregate and emits
//! typed [`SessionEvent`]s. Renderers that only want the latest state can
//! [`subscribe`](SimulationSession::subscribe) instead of driving `recv`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::stream::client::{
    StreamClient, StreamClientError, StreamCloser, StreamConnection, TransportEvent,
};
use crate::stream::proto::{classify, RejectedEntry, StreamMessage};
use crate::stream::series::AggregateState;

/// Lifecycle of a session's stream connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    /// Terminal. No message is processed after this.
    Closed,
}

/// Why a session reached [`ConnectionState::Closed`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// The producer reported the run as complete.
    Completed,
    /// The session was cancelled by its owner.
    Cancelled,
    /// The reconnect policy gave up after this many consecutive failures.
    RetriesExhausted { attempts: usize },
    /// The transport stopped without a completion marker.
    TransportStopped,
}

/// Session-level event emitted by [`SimulationSession::recv`].
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Connection state moved to a non-terminal state.
    StateChanged(ConnectionState),
    /// Liveness marker from the producer.
    Heartbeat,
    /// A data frame was folded into the aggregate.
    FrameApplied {
        /// Read-only snapshot taken right after the frame was applied.
        snapshot: Arc<AggregateState>,
        /// Agent entries of this frame that failed validation.
        rejected: Vec<RejectedEntry>,
    },
    /// Non-fatal error reported by the producer. The stream stays open.
    ServerError { message: String },
    /// The session ended. `recv` returns `None` afterwards.
    Closed(CloseReason),
}

/// Cloneable handle that cancels a session from another task.
#[derive(Clone, Debug)]
pub struct SessionCancel {
    cancelled: Arc<AtomicBool>,
    closer: StreamCloser,
}

impl SessionCancel {
    /// Stops publishing and closes the transport. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.closer.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Stateful consumer of one simulation stream.
#[derive(Debug)]
pub struct SimulationSession {
    connection: StreamConnection,
    state: ConnectionState,
    aggregate: Arc<AggregateState>,
    pending: VecDeque<SessionEvent>,
    cancel: SessionCancel,
    published: watch::Sender<Arc<AggregateState>>,
    state_tx: watch::Sender<ConnectionState>,
}

impl SimulationSession {
    /// Opens the stream described by `client` and starts an empty session.
    pub fn connect(client: &StreamClient) -> Result<Self, StreamClientError> {
        Ok(Self::from_connection(client.connect()?))
    }

    /// Creates a session from an existing low-level connection.
    pub fn from_connection(connection: StreamConnection) -> Self {
        let aggregate = Arc::new(AggregateState::new());
        let (published, _) = watch::channel(Arc::clone(&aggregate));
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let cancel = SessionCancel {
            cancelled: Arc::new(AtomicBool::new(false)),
            closer: connection.closer(),
        };

        Self {
            connection,
            state: ConnectionState::Connecting,
            aggregate,
            pending: VecDeque::new(),
            cancel,
            published,
            state_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Current aggregate as a read-only snapshot.
    pub fn aggregate(&self) -> Arc<AggregateState> {
        Arc::clone(&self.aggregate)
    }

    /// Subscribes to aggregate snapshots published after every ingested
    /// frame. Receivers always observe a fully applied frame.
    pub fn subscribe(&self) -> watch::Receiver<Arc<AggregateState>> {
        self.published.subscribe()
    }

    /// Subscribes to connection state changes, including the terminal
    /// [`ConnectionState::Closed`].
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn cancel_handle(&self) -> SessionCancel {
        self.cancel.clone()
    }

    /// Cancels the session and closes the transport.
    pub fn close(mut self) {
        self.cancel.cancel();
        self.shut_down(CloseReason::Cancelled);
    }

    /// Drives the session until it closes and returns why it closed.
    pub async fn run(mut self) -> CloseReason {
        let mut reason = CloseReason::TransportStopped;
        while let Some(event) = self.recv().await {
            if let SessionEvent::Closed(closed) = event {
                reason = closed;
            }
        }
        reason
    }

    /// Processes transport events until one produces a [`SessionEvent`].
    ///
    /// Returns `None` once the session is closed and every queued event has
    /// been delivered.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            if self.cancel.is_cancelled() && self.state != ConnectionState::Closed {
                self.pending.clear();
                return Some(self.shut_down(CloseReason::Cancelled));
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if self.state == ConnectionState::Closed {
                return None;
            }

            match self.connection.recv().await {
                Some(event) => self.handle_transport_event(event),
                None => {
                    let reason = if self.cancel.is_cancelled() {
                        CloseReason::Cancelled
                    } else {
                        CloseReason::TransportStopped
                    };
                    let event = self.shut_down(reason);
                    self.pending.push_back(event);
                }
            }
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connecting { attempt } => {
                debug!(event = "session_connecting", attempt);
                self.transition(ConnectionState::Connecting);
            }
            TransportEvent::Message(raw) => {
                if self.state != ConnectionState::Open {
                    self.transition(ConnectionState::Open);
                }
                self.handle_message(&raw);
            }
            TransportEvent::Disconnected { error } => {
                warn!(event = "session_transport_failed", error = %error);
                self.transition(ConnectionState::Reconnecting);
            }
            TransportEvent::GaveUp { attempts } => {
                let event = self.shut_down(CloseReason::RetriesExhausted { attempts });
                self.pending.push_back(event);
            }
            TransportEvent::Closed => {
                let reason = if self.cancel.is_cancelled() {
                    CloseReason::Cancelled
                } else {
                    CloseReason::TransportStopped
                };
                let event = self.shut_down(reason);
                self.pending.push_back(event);
            }
        }
    }

    fn handle_message(&mut self, raw: &str) {
        let message = match classify(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(event = "stream_message_dropped", error = %err);
                return;
            }
        };

        match message {
            StreamMessage::Heartbeat => {
                debug!(event = "stream_heartbeat");
                self.pending.push_back(SessionEvent::Heartbeat);
            }
            StreamMessage::Complete => {
                let event = self.shut_down(CloseReason::Completed);
                self.pending.push_back(event);
            }
            StreamMessage::ErrorSignal(message) => {
                warn!(event = "server_error_signal", message = %message);
                self.pending
                    .push_back(SessionEvent::ServerError { message });
            }
            StreamMessage::DataFrame(frame) => {
                for entry in &frame.rejected {
                    warn!(
                        event = "frame_entry_rejected",
                        agent = %entry.agent,
                        reason = %entry.reason
                    );
                }
                // The published watch keeps a reference, so this clones per-agent
                // tails and chunk handles; sealed history stays shared.
                Arc::make_mut(&mut self.aggregate).ingest(frame.agents);

                if self.cancel.is_cancelled() {
                    return;
                }
                let snapshot = Arc::clone(&self.aggregate);
                self.published.send_replace(Arc::clone(&snapshot));
                self.pending.push_back(SessionEvent::FrameApplied {
                    snapshot,
                    rejected: frame.rejected,
                });
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next || self.state == ConnectionState::Closed {
            return;
        }
        info!(event = "session_state_changed", from = ?self.state, to = ?next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.pending.push_back(SessionEvent::StateChanged(next));
    }

    fn shut_down(&mut self, reason: CloseReason) -> SessionEvent {
        self.connection.close();
        if self.state != ConnectionState::Closed {
            info!(event = "session_closed", reason = ?reason);
            self.state = ConnectionState::Closed;
            self.state_tx.send_replace(ConnectionState::Closed);
        }
        SessionEvent::Closed(reason)
    }
}

impl Drop for SimulationSession {
    fn drop(&mut self) {
        self.connection.close();
    }
}

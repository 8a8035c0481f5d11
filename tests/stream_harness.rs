use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use simviz_stream::retry::RetryPolicy;
use simviz_stream::stream::{
    CloseReason, ConnectionState, SessionEvent, SimulationSession, StreamClient,
    StreamClientError, TransportEvent,
};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

const STREAM_PATH: &str = "/simulation/stream";

#[derive(Clone)]
struct ScriptState {
    connections: Arc<AtomicUsize>,
    queries: Arc<Mutex<Vec<Option<String>>>>,
    scripts: Arc<Vec<Script>>,
}

#[derive(Clone)]
enum Script {
    /// Respond with this status and no stream.
    Status(StatusCode),
    /// Send these payloads, then end the response.
    Finite(Vec<Value>),
    /// Send these payloads, then keep the response open.
    Hold(Vec<Value>),
}

fn body_frame(x1: f64, x2: f64) -> Value {
    json!({
        "time": x1,
        "timeStep": 0.1,
        "Body1": {"position": {"x": x1, "y": 0.0, "z": 0.0}, "velocity": {"x": 0.0, "y": -0.0015, "z": 0.0}, "mass": 1.0},
        "Body2": {"position": {"x": x2, "y": 0.0, "z": 0.0}, "velocity": {"x": 0.0, "y": 0.13, "z": 0.0}, "mass": 0.0123},
    })
}

async fn stream_handler(State(state): State<ScriptState>, RawQuery(query): RawQuery) -> Response {
    let index = state.connections.fetch_add(1, Ordering::SeqCst);
    state.queries.lock().await.push(query);

    let script = state
        .scripts
        .get(index)
        .or_else(|| state.scripts.last())
        .cloned()
        .unwrap_or(Script::Status(StatusCode::NOT_FOUND));

    let events = |payloads: Vec<Value>| {
        stream::iter(
            payloads
                .into_iter()
                .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload.to_string())))
                .collect::<Vec<_>>(),
        )
    };

    match script {
        Script::Status(status) => status.into_response(),
        Script::Finite(payloads) => Sse::new(events(payloads)).into_response(),
        Script::Hold(payloads) => {
            Sse::new(events(payloads).chain(stream::pending())).into_response()
        }
    }
}

async fn spawn_server(
    scripts: Vec<Script>,
) -> (
    SocketAddr,
    ScriptState,
    oneshot::Sender<()>,
    tokio::task::JoinHandle<()>,
) {
    let state = ScriptState {
        connections: Arc::new(AtomicUsize::new(0)),
        queries: Arc::new(Mutex::new(Vec::new())),
        scripts: Arc::new(scripts),
    };
    let app = Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock server listener");
    let addr = listener
        .local_addr()
        .expect("read mock server listener address");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("mock server should run");
    });
    (addr, state, shutdown_tx, task)
}

fn client_for(addr: SocketAddr) -> StreamClient {
    StreamClient::new()
        .with_endpoint(format!("http://{addr}{STREAM_PATH}"))
        .with_reconnect_policy(RetryPolicy::fixed_interval(Duration::from_millis(20)))
        .with_idle_timeout(Some(Duration::from_secs(2)))
}

async fn collect_events(session: &mut SimulationSession) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    loop {
        let next = timeout(Duration::from_secs(5), session.recv())
            .await
            .expect("timed out waiting for session event");
        match next {
            Some(event) => events.push(event),
            None => return events,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_resumes_after_stream_drop_and_closes_on_complete() {
    let (addr, state, shutdown_tx, server_task) = spawn_server(vec![
        Script::Finite(vec![
            json!({"heartbeat": true}),
            body_frame(1.0, 10.0),
            body_frame(2.0, 20.0),
        ]),
        Script::Finite(vec![
            body_frame(3.0, 30.0),
            json!({"error": "cycle 3 slow"}),
            json!({"complete": true}),
            body_frame(99.0, 99.0),
        ]),
    ])
    .await;

    let client = client_for(addr).with_query_string("?Body1.position.x=-0.73&speed=2");
    let mut session = SimulationSession::connect(&client).expect("open session");
    let mut published = session.subscribe();
    let events = collect_events(&mut session).await;

    assert!(matches!(
        events.last(),
        Some(SessionEvent::Closed(CloseReason::Completed))
    ));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::StateChanged(ConnectionState::Reconnecting))));
    assert!(events
        .iter()
        .any(|event| matches!(event, SessionEvent::ServerError { .. })));

    let aggregate = session.aggregate();
    let body1 = aggregate.series_for("Body1").expect("Body1 series");
    let body2 = aggregate.series_for("Body2").expect("Body2 series");
    assert_eq!(body1.position().x(), &[1.0, 2.0, 3.0]);
    assert_eq!(body2.position().x(), &[10.0, 20.0, 30.0]);
    assert_eq!(body1.velocity().y(), &[-0.0015, -0.0015, -0.0015]);
    assert_eq!(aggregate.initial_snapshot()["Body1"].position.x, 1.0);
    assert_eq!(aggregate.latest_frame()["Body2"].position.x, 30.0);
    assert!(aggregate.series_for("time").is_none());
    assert!(aggregate.series_for("timeStep").is_none());

    assert_eq!(**published.borrow_and_update(), *aggregate);
    assert_eq!(session.state(), ConnectionState::Closed);

    let queries = state.queries.lock().await.clone();
    assert_eq!(queries.len(), 2);
    for query in queries {
        assert_eq!(query.as_deref(), Some("Body1.position.x=-0.73&speed=2"));
    }

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_endpoint_retries_until_policy_gives_up() {
    let (addr, state, shutdown_tx, server_task) =
        spawn_server(vec![Script::Status(StatusCode::SERVICE_UNAVAILABLE)]).await;

    let client = client_for(addr).with_reconnect_policy(
        RetryPolicy::fixed_interval(Duration::from_millis(10)).with_max_attempts(3),
    );
    let session = SimulationSession::connect(&client).expect("open session");
    let mut connection_state = session.watch_state();

    let reason = timeout(Duration::from_secs(5), session.run())
        .await
        .expect("session should give up");
    assert_eq!(reason, CloseReason::RetriesExhausted { attempts: 3 });
    assert_eq!(state.connections.load(Ordering::SeqCst), 3);
    assert_eq!(
        *connection_state.borrow_and_update(),
        ConnectionState::Closed
    );

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_producer_does_not_end_an_uncapped_session() {
    let (addr, state, shutdown_tx, server_task) = spawn_server(vec![
        Script::Status(StatusCode::SERVICE_UNAVAILABLE),
        Script::Status(StatusCode::BAD_GATEWAY),
        Script::Finite(vec![body_frame(5.0, 50.0), json!({"complete": true})]),
    ])
    .await;

    let mut session = SimulationSession::connect(&client_for(addr)).expect("open session");
    let events = collect_events(&mut session).await;

    assert!(matches!(
        events.last(),
        Some(SessionEvent::Closed(CloseReason::Completed))
    ));
    assert_eq!(state.connections.load(Ordering::SeqCst), 3);
    assert_eq!(session.aggregate().frames_ingested(), 1);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancellation_from_another_task_closes_open_stream() {
    let (addr, _state, shutdown_tx, server_task) =
        spawn_server(vec![Script::Hold(vec![body_frame(1.0, 10.0)])]).await;

    let mut session = SimulationSession::connect(&client_for(addr)).expect("open session");
    let cancel = session.cancel_handle();

    let first_frame = timeout(Duration::from_secs(5), async {
        while let Some(event) = session.recv().await {
            if matches!(event, SessionEvent::FrameApplied { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .expect("timed out waiting for first frame");
    assert!(first_frame);

    let canceller = tokio::spawn(async move {
        cancel.cancel();
        cancel.cancel();
    });
    canceller.await.expect("cancel task should join");

    let reason = timeout(Duration::from_secs(5), session.run())
        .await
        .expect("session should close after cancel");
    assert_eq!(reason, CloseReason::Cancelled);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_during_reconnect_delay_stops_worker_promptly() {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind unused listener");
    let addr = listener.local_addr().expect("read unused listener address");
    drop(listener);

    let client = client_for(addr)
        .with_reconnect_policy(RetryPolicy::fixed_interval(Duration::from_secs(10)));
    let mut connection = client.connect().expect("open connection");

    let disconnected = timeout(Duration::from_secs(5), async {
        while let Some(event) = connection.recv().await {
            if let TransportEvent::Disconnected { error } = event {
                return Some(error);
            }
        }
        None
    })
    .await
    .expect("timed out waiting for refused connection");
    assert!(matches!(disconnected, Some(StreamClientError::Http(_))));

    let closer = connection.closer();
    closer.close();
    closer.close();
    assert!(closer.is_closed());

    let next = timeout(Duration::from_secs(1), connection.recv())
        .await
        .expect("worker should stop well before the reconnect delay");
    assert!(matches!(next, Some(TransportEvent::Closed)));
    let end = timeout(Duration::from_secs(1), connection.recv())
        .await
        .expect("channel should close after the worker stops");
    assert!(end.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_stream_is_dropped_after_idle_timeout() {
    let (addr, state, shutdown_tx, server_task) = spawn_server(vec![
        Script::Hold(vec![]),
        Script::Finite(vec![body_frame(1.0, 10.0), json!({"complete": true})]),
    ])
    .await;

    let client = client_for(addr).with_idle_timeout(Some(Duration::from_millis(150)));
    let mut connection = client.connect().expect("open connection");

    let error = timeout(Duration::from_secs(5), async {
        while let Some(event) = connection.recv().await {
            if let TransportEvent::Disconnected { error } = event {
                return Some(error);
            }
        }
        None
    })
    .await
    .expect("timed out waiting for idle disconnect");
    assert!(matches!(
        error,
        Some(StreamClientError::IdleTimeout(limit)) if limit == Duration::from_millis(150)
    ));
    connection.close();

    let mut session = SimulationSession::connect(&client).expect("open session");
    let events = collect_events(&mut session).await;
    assert!(matches!(
        events.last(),
        Some(SessionEvent::Closed(CloseReason::Completed))
    ));
    assert_eq!(session.aggregate().frames_ingested(), 1);
    assert!(state.connections.load(Ordering::SeqCst) >= 2);

    let _ = shutdown_tx.send(());
    server_task.await.expect("mock server task should join");
}

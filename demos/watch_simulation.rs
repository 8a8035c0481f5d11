use std::error::Error;

use simviz_stream::sim_api::InitialConditions;
use simviz_stream::stream::{SessionEvent, SimulationSession, StreamClient};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = StreamClient::new()
            .with_query_pairs(InitialConditions::default_two_body().stream_query_pairs())
            .with_query_pair("speed", "4");
        let mut session = SimulationSession::connect(&client)?;

        let cancel = session.cancel_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        while let Some(event) = session.recv().await {
            match event {
                SessionEvent::FrameApplied { snapshot, .. } => {
                    for (agent, state) in snapshot.latest_frame() {
                        println!(
                            "frame={} agent={agent} position=({:.4}, {:.4}, {:.4})",
                            snapshot.frames_ingested(),
                            state.position.x,
                            state.position.y,
                            state.position.z,
                        );
                    }
                }
                SessionEvent::StateChanged(state) => println!("connection={state:?}"),
                SessionEvent::ServerError { message } => println!("server error: {message}"),
                SessionEvent::Closed(reason) => println!("closed: {reason:?}"),
                SessionEvent::Heartbeat => {}
            }
        }

        let aggregate = session.aggregate();
        for (agent, series) in aggregate.series() {
            println!("{agent}: {} samples", series.len());
        }

        Ok::<(), Box<dyn Error>>(())
    })
}

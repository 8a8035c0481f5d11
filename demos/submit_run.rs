use std::error::Error;

use simviz_stream::sim_api::{InitialConditions, SimApiClient};

fn main() -> Result<(), Box<dyn Error>> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = SimApiClient::new()?;
        client
            .submit_run(&InitialConditions::default_two_body())
            .await?;

        let aggregate = client.replay_latest().await?;
        for (agent, state) in aggregate.initial_snapshot() {
            println!(
                "{agent}: initial position=({}, {}, {}) velocity=({}, {}, {})",
                state.position.x,
                state.position.y,
                state.position.z,
                state.velocity.x,
                state.velocity.y,
                state.velocity.z,
            );
        }
        println!("{} frames replayed", aggregate.frames_ingested());

        Ok::<(), Box<dyn Error>>(())
    })
}

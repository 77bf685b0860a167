use weft::{Config, Tracker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = Config::load()?;

    let mut tracker = Tracker::bind(
        (config.tracker.host.as_str(), config.tracker.port),
        &config.tracker.state_dir,
    )
    .await?;

    tracker
        .peer_timeout(config.peer_timeout())
        .sweep_interval(config.heartbeat_interval());

    tracker.up().await?;

    Ok(())
}
